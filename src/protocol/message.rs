//! 9P2000 message codec.
//!
//! One statically typed variant per message kind. Requests are encoded by
//! the client and decoded only by tests and scripted servers; responses are
//! the other way round. Layouts follow intro(5):
//!
//! ```text
//! Tversion  msize[4] version[s]          Rversion  msize[4] version[s]
//! Tauth     afid[4] uname[s] aname[s]    Rauth     aqid[13]
//! Tattach   fid[4] afid[4] uname[s] aname[s]
//!                                        Rattach   qid[13]
//!                                        Rerror    ename[s]
//! Tflush    oldtag[2]                    Rflush
//! Twalk     fid[4] newfid[4] nwname[2] nwname*(wname[s])
//!                                        Rwalk     nwqid[2] nwqid*(qid[13])
//! Topen     fid[4] mode[1]               Ropen     qid[13] iounit[4]
//! Tcreate   fid[4] name[s] perm[4] mode[1]
//!                                        Rcreate   qid[13] iounit[4]
//! Tread     fid[4] offset[8] count[4]    Rread     count[4] data[count]
//! Twrite    fid[4] offset[8] count[4] data[count]
//!                                        Rwrite    count[4]
//! Tclunk    fid[4]                       Rclunk
//! Tremove   fid[4]                       Rremove
//! Tstat     fid[4]                       Rstat     n[2] stat[n]
//! Twstat    fid[4] n[2] stat[n]          Rwstat
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::types::{ensure_remaining, get_str, get_str_lossy, put_str, OpenMode, Qid, Stat};
use super::wire_format::{Header, MessageType, HEADER_SIZE, MAXWELEM};
use crate::error::{NineError, Result};

/// A client request (T-message) body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tmessage {
    Version { msize: u32, version: String },
    Auth { afid: u32, uname: String, aname: String },
    Attach { fid: u32, afid: u32, uname: String, aname: String },
    Flush { oldtag: u16 },
    Walk { fid: u32, newfid: u32, wnames: Vec<String> },
    Open { fid: u32, mode: OpenMode },
    Create { fid: u32, name: String, perm: u32, mode: OpenMode },
    Read { fid: u32, offset: u64, count: u32 },
    Write { fid: u32, offset: u64, data: Bytes },
    Clunk { fid: u32 },
    Remove { fid: u32 },
    Stat { fid: u32 },
    Wstat { fid: u32, stat: Stat },
}

impl Tmessage {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Tmessage::Version { .. } => MessageType::Tversion,
            Tmessage::Auth { .. } => MessageType::Tauth,
            Tmessage::Attach { .. } => MessageType::Tattach,
            Tmessage::Flush { .. } => MessageType::Tflush,
            Tmessage::Walk { .. } => MessageType::Twalk,
            Tmessage::Open { .. } => MessageType::Topen,
            Tmessage::Create { .. } => MessageType::Tcreate,
            Tmessage::Read { .. } => MessageType::Tread,
            Tmessage::Write { .. } => MessageType::Twrite,
            Tmessage::Clunk { .. } => MessageType::Tclunk,
            Tmessage::Remove { .. } => MessageType::Tremove,
            Tmessage::Stat { .. } => MessageType::Tstat,
            Tmessage::Wstat { .. } => MessageType::Twstat,
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Tmessage::Version { msize, version } => {
                buf.put_u32_le(*msize);
                put_str(buf, version)?;
            }
            Tmessage::Auth { afid, uname, aname } => {
                buf.put_u32_le(*afid);
                put_str(buf, uname)?;
                put_str(buf, aname)?;
            }
            Tmessage::Attach {
                fid,
                afid,
                uname,
                aname,
            } => {
                buf.put_u32_le(*fid);
                buf.put_u32_le(*afid);
                put_str(buf, uname)?;
                put_str(buf, aname)?;
            }
            Tmessage::Flush { oldtag } => buf.put_u16_le(*oldtag),
            Tmessage::Walk {
                fid,
                newfid,
                wnames,
            } => {
                if wnames.len() > MAXWELEM {
                    return Err(NineError::InvalidArgument(format!(
                        "walk of {} elements exceeds maximum {}",
                        wnames.len(),
                        MAXWELEM
                    )));
                }
                buf.put_u32_le(*fid);
                buf.put_u32_le(*newfid);
                buf.put_u16_le(wnames.len() as u16);
                for name in wnames {
                    put_str(buf, name)?;
                }
            }
            Tmessage::Open { fid, mode } => {
                buf.put_u32_le(*fid);
                buf.put_u8(mode.bits());
            }
            Tmessage::Create {
                fid,
                name,
                perm,
                mode,
            } => {
                buf.put_u32_le(*fid);
                put_str(buf, name)?;
                buf.put_u32_le(*perm);
                buf.put_u8(mode.bits());
            }
            Tmessage::Read { fid, offset, count } => {
                buf.put_u32_le(*fid);
                buf.put_u64_le(*offset);
                buf.put_u32_le(*count);
            }
            Tmessage::Write { fid, offset, data } => {
                let count = u32::try_from(data.len()).map_err(|_| {
                    NineError::InvalidArgument(format!("write of {} bytes", data.len()))
                })?;
                buf.put_u32_le(*fid);
                buf.put_u64_le(*offset);
                buf.put_u32_le(count);
                buf.put_slice(data);
            }
            Tmessage::Clunk { fid } | Tmessage::Remove { fid } | Tmessage::Stat { fid } => {
                buf.put_u32_le(*fid)
            }
            Tmessage::Wstat { fid, stat } => {
                buf.put_u32_le(*fid);
                stat.encode_counted(buf)?;
            }
        }
        Ok(())
    }

    fn decode_body(ty: MessageType, buf: &mut &[u8]) -> Result<Self> {
        let msg = match ty {
            MessageType::Tversion => {
                ensure_remaining(buf, 4, "Tversion")?;
                Tmessage::Version {
                    msize: buf.get_u32_le(),
                    version: get_str(buf)?,
                }
            }
            MessageType::Tauth => {
                ensure_remaining(buf, 4, "Tauth")?;
                Tmessage::Auth {
                    afid: buf.get_u32_le(),
                    uname: get_str(buf)?,
                    aname: get_str(buf)?,
                }
            }
            MessageType::Tattach => {
                ensure_remaining(buf, 8, "Tattach")?;
                Tmessage::Attach {
                    fid: buf.get_u32_le(),
                    afid: buf.get_u32_le(),
                    uname: get_str(buf)?,
                    aname: get_str(buf)?,
                }
            }
            MessageType::Tflush => {
                ensure_remaining(buf, 2, "Tflush")?;
                Tmessage::Flush {
                    oldtag: buf.get_u16_le(),
                }
            }
            MessageType::Twalk => {
                ensure_remaining(buf, 10, "Twalk")?;
                let fid = buf.get_u32_le();
                let newfid = buf.get_u32_le();
                let nwname = buf.get_u16_le() as usize;
                if nwname > MAXWELEM {
                    return Err(NineError::Decode(format!("Twalk with {} elements", nwname)));
                }
                let wnames = (0..nwname)
                    .map(|_| get_str(buf))
                    .collect::<Result<Vec<_>>>()?;
                Tmessage::Walk {
                    fid,
                    newfid,
                    wnames,
                }
            }
            MessageType::Topen => {
                ensure_remaining(buf, 5, "Topen")?;
                Tmessage::Open {
                    fid: buf.get_u32_le(),
                    mode: OpenMode::from_bits(buf.get_u8()),
                }
            }
            MessageType::Tcreate => {
                ensure_remaining(buf, 4, "Tcreate")?;
                let fid = buf.get_u32_le();
                let name = get_str(buf)?;
                ensure_remaining(buf, 5, "Tcreate")?;
                Tmessage::Create {
                    fid,
                    name,
                    perm: buf.get_u32_le(),
                    mode: OpenMode::from_bits(buf.get_u8()),
                }
            }
            MessageType::Tread => {
                ensure_remaining(buf, 16, "Tread")?;
                Tmessage::Read {
                    fid: buf.get_u32_le(),
                    offset: buf.get_u64_le(),
                    count: buf.get_u32_le(),
                }
            }
            MessageType::Twrite => {
                ensure_remaining(buf, 16, "Twrite")?;
                let fid = buf.get_u32_le();
                let offset = buf.get_u64_le();
                let count = buf.get_u32_le() as usize;
                ensure_remaining(buf, count, "Twrite data")?;
                let data = Bytes::copy_from_slice(&buf[..count]);
                buf.advance(count);
                Tmessage::Write { fid, offset, data }
            }
            MessageType::Tclunk | MessageType::Tremove | MessageType::Tstat => {
                ensure_remaining(buf, 4, "fid")?;
                let fid = buf.get_u32_le();
                match ty {
                    MessageType::Tclunk => Tmessage::Clunk { fid },
                    MessageType::Tremove => Tmessage::Remove { fid },
                    _ => Tmessage::Stat { fid },
                }
            }
            MessageType::Twstat => {
                ensure_remaining(buf, 6, "Twstat")?;
                let fid = buf.get_u32_le();
                let n = buf.get_u16_le() as usize;
                ensure_remaining(buf, n, "Twstat stat")?;
                let mut inner = &buf[..n];
                let stat = Stat::decode(&mut inner)?;
                if !inner.is_empty() {
                    return Err(NineError::Decode("Twstat stat length mismatch".into()));
                }
                buf.advance(n);
                Tmessage::Wstat { fid, stat }
            }
            other => {
                return Err(NineError::Decode(format!(
                    "{:?} is not a request",
                    other
                )))
            }
        };
        Ok(msg)
    }
}

/// A server response (R-message) body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rmessage {
    Version { msize: u32, version: String },
    Auth { aqid: Qid },
    Attach { qid: Qid },
    Error { ename: String },
    Flush,
    Walk { wqids: Vec<Qid> },
    Open { qid: Qid, iounit: u32 },
    Create { qid: Qid, iounit: u32 },
    /// Read data shares the frame's buffer; it is never copied out.
    Read { data: Bytes },
    Write { count: u32 },
    Clunk,
    Remove,
    Stat { stat: Stat },
    Wstat,
}

impl Rmessage {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Rmessage::Version { .. } => MessageType::Rversion,
            Rmessage::Auth { .. } => MessageType::Rauth,
            Rmessage::Attach { .. } => MessageType::Rattach,
            Rmessage::Error { .. } => MessageType::Rerror,
            Rmessage::Flush => MessageType::Rflush,
            Rmessage::Walk { .. } => MessageType::Rwalk,
            Rmessage::Open { .. } => MessageType::Ropen,
            Rmessage::Create { .. } => MessageType::Rcreate,
            Rmessage::Read { .. } => MessageType::Rread,
            Rmessage::Write { .. } => MessageType::Rwrite,
            Rmessage::Clunk => MessageType::Rclunk,
            Rmessage::Remove => MessageType::Rremove,
            Rmessage::Stat { .. } => MessageType::Rstat,
            Rmessage::Wstat => MessageType::Rwstat,
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Rmessage::Version { msize, version } => {
                buf.put_u32_le(*msize);
                put_str(buf, version)?;
            }
            Rmessage::Auth { aqid: qid } | Rmessage::Attach { qid } => qid.encode(buf),
            Rmessage::Error { ename } => put_str(buf, ename)?,
            Rmessage::Walk { wqids } => {
                buf.put_u16_le(wqids.len() as u16);
                for qid in wqids {
                    qid.encode(buf);
                }
            }
            Rmessage::Open { qid, iounit } | Rmessage::Create { qid, iounit } => {
                qid.encode(buf);
                buf.put_u32_le(*iounit);
            }
            Rmessage::Read { data } => {
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
            }
            Rmessage::Write { count } => buf.put_u32_le(*count),
            Rmessage::Stat { stat } => stat.encode_counted(buf)?,
            Rmessage::Flush | Rmessage::Clunk | Rmessage::Remove | Rmessage::Wstat => {}
        }
        Ok(())
    }
}

/// Serialize a complete message: header placeholder, body, then patch size.
fn build_message<F>(ty: MessageType, tag: u16, body: F) -> Result<Bytes>
where
    F: FnOnce(&mut BytesMut) -> Result<()>,
{
    let mut buf = BytesMut::with_capacity(64);
    buf.put_slice(&[0u8; HEADER_SIZE]);
    body(&mut buf)?;

    let size = u32::try_from(buf.len())
        .map_err(|_| NineError::InvalidArgument(format!("message of {} bytes", buf.len())))?;
    Header::new(size, ty.as_u8(), tag).encode_into(&mut buf[..HEADER_SIZE]);
    Ok(buf.freeze())
}

/// Encode a request with the given tag.
///
/// # Example
///
/// ```
/// use ninep_client::protocol::{encode_request, Tmessage};
///
/// let bytes = encode_request(0, &Tmessage::Version {
///     msize: 8192,
///     version: "9P2000".into(),
/// }).unwrap();
/// assert_eq!(bytes.len(), 7 + 4 + 2 + 6);
/// assert_eq!(&bytes[..4], &(bytes.len() as u32).to_le_bytes());
/// ```
pub fn encode_request(tag: u16, msg: &Tmessage) -> Result<Bytes> {
    build_message(msg.msg_type(), tag, |buf| msg.encode_body(buf))
}

/// Encode a response with the given tag.
pub fn encode_response(tag: u16, msg: &Rmessage) -> Result<Bytes> {
    build_message(msg.msg_type(), tag, |buf| msg.encode_body(buf))
}

/// Decode a complete request. Returns the tag and the body.
pub fn decode_request(bytes: &[u8]) -> Result<(u16, Tmessage)> {
    let header = Header::decode(bytes)
        .ok_or_else(|| NineError::Decode(format!("truncated header: {} bytes", bytes.len())))?;
    check_exact_size(&header, bytes.len())?;
    let ty = MessageType::from_u8(header.msg_type).ok_or(NineError::UnknownType(header.msg_type))?;

    let mut body = &bytes[HEADER_SIZE..];
    let msg = Tmessage::decode_body(ty, &mut body)?;
    ensure_consumed(ty, body)?;
    Ok((header.tag, msg))
}

/// Decode a complete response held in `raw`, header included.
///
/// Rerror is recognised before anything else so an error reply can never be
/// mistaken for the success layout of the request that provoked it.
pub fn decode_response(raw: &Bytes) -> Result<(Header, Rmessage)> {
    let header = Header::decode(raw)
        .ok_or_else(|| NineError::Decode(format!("truncated header: {} bytes", raw.len())))?;
    check_exact_size(&header, raw.len())?;
    let ty = MessageType::from_u8(header.msg_type).ok_or(NineError::UnknownType(header.msg_type))?;
    let msg = decode_response_body(ty, raw)?;
    Ok((header, msg))
}

/// Decode the body of a response of known type. `raw` holds the whole message.
pub(crate) fn decode_response_body(ty: MessageType, raw: &Bytes) -> Result<Rmessage> {
    if ty == MessageType::Rerror {
        let mut body = &raw[HEADER_SIZE..];
        let ename = get_str_lossy(&mut body)?;
        ensure_consumed(ty, body)?;
        return Ok(Rmessage::Error { ename });
    }

    let mut body = &raw[HEADER_SIZE..];
    let msg = match ty {
        MessageType::Rversion => {
            ensure_remaining(&body, 4, "Rversion")?;
            Rmessage::Version {
                msize: body.get_u32_le(),
                version: get_str(&mut body)?,
            }
        }
        MessageType::Rauth => Rmessage::Auth {
            aqid: Qid::decode(&mut body)?,
        },
        MessageType::Rattach => Rmessage::Attach {
            qid: Qid::decode(&mut body)?,
        },
        MessageType::Rflush => Rmessage::Flush,
        MessageType::Rwalk => {
            ensure_remaining(&body, 2, "Rwalk")?;
            let nwqid = body.get_u16_le() as usize;
            if nwqid > MAXWELEM {
                return Err(NineError::Decode(format!("Rwalk with {} qids", nwqid)));
            }
            let wqids = (0..nwqid)
                .map(|_| Qid::decode(&mut body))
                .collect::<Result<Vec<_>>>()?;
            Rmessage::Walk { wqids }
        }
        MessageType::Ropen | MessageType::Rcreate => {
            let qid = Qid::decode(&mut body)?;
            ensure_remaining(&body, 4, "iounit")?;
            let iounit = body.get_u32_le();
            if ty == MessageType::Ropen {
                Rmessage::Open { qid, iounit }
            } else {
                Rmessage::Create { qid, iounit }
            }
        }
        MessageType::Rread => {
            ensure_remaining(&body, 4, "Rread")?;
            let count = body.get_u32_le() as usize;
            ensure_remaining(&body, count, "Rread data")?;
            let start = HEADER_SIZE + 4;
            body.advance(count);
            Rmessage::Read {
                data: raw.slice(start..start + count),
            }
        }
        MessageType::Rwrite => {
            ensure_remaining(&body, 4, "Rwrite")?;
            Rmessage::Write {
                count: body.get_u32_le(),
            }
        }
        MessageType::Rclunk => Rmessage::Clunk,
        MessageType::Rremove => Rmessage::Remove,
        MessageType::Rstat => {
            ensure_remaining(&body, 2, "Rstat")?;
            let n = body.get_u16_le() as usize;
            ensure_remaining(&body, n, "Rstat stat")?;
            let mut inner = &body[..n];
            let stat = Stat::decode(&mut inner)?;
            if !inner.is_empty() {
                return Err(NineError::Decode("Rstat stat length mismatch".into()));
            }
            body.advance(n);
            Rmessage::Stat { stat }
        }
        MessageType::Rwstat => Rmessage::Wstat,
        other => {
            return Err(NineError::Decode(format!(
                "{:?} is not a response",
                other
            )))
        }
    };
    ensure_consumed(ty, body)?;
    Ok(msg)
}

fn check_exact_size(header: &Header, available: usize) -> Result<()> {
    if header.size as usize != available {
        return Err(NineError::Decode(format!(
            "header size {} but {} bytes supplied",
            header.size, available
        )));
    }
    Ok(())
}

fn ensure_consumed(ty: MessageType, rest: &[u8]) -> Result<()> {
    if !rest.is_empty() {
        return Err(NineError::Decode(format!(
            "{} trailing bytes after {:?}",
            rest.len(),
            ty
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::QidType;
    use crate::protocol::wire_format::{NOFID, VERSION_9P2000};

    fn roundtrip(msg: Tmessage) {
        let bytes = encode_request(17, &msg).unwrap();
        assert_eq!(
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize,
            bytes.len()
        );
        assert_eq!(bytes[4], msg.msg_type().as_u8());
        let (tag, decoded) = decode_request(&bytes).unwrap();
        assert_eq!(tag, 17);
        assert_eq!(decoded, msg);
    }

    fn sample_stat() -> Stat {
        Stat {
            typ: 1,
            dev: 2,
            qid: Qid::new(QidType::DIR, 3, 4),
            mode: 0o755,
            atime: 5,
            mtime: 6,
            length: 7,
            name: "dir".into(),
            uid: "glenda".into(),
            gid: "".into(),
            muid: "bootes".into(),
            ..Default::default()
        }
        .sized()
    }

    #[test]
    fn test_request_roundtrip_all_kinds() {
        let long = "n".repeat(u16::MAX as usize);

        roundtrip(Tmessage::Version {
            msize: 8192,
            version: VERSION_9P2000.into(),
        });
        roundtrip(Tmessage::Auth {
            afid: 5,
            uname: String::new(),
            aname: long.clone(),
        });
        roundtrip(Tmessage::Attach {
            fid: 0,
            afid: NOFID,
            uname: "glenda".into(),
            aname: String::new(),
        });
        roundtrip(Tmessage::Flush { oldtag: 9 });
        roundtrip(Tmessage::Walk {
            fid: 0,
            newfid: 1,
            wnames: vec!["usr".into(), String::new(), "lib".into()],
        });
        roundtrip(Tmessage::Walk {
            fid: 0,
            newfid: 2,
            wnames: Vec::new(),
        });
        roundtrip(Tmessage::Open {
            fid: 1,
            mode: OpenMode::RDWR | OpenMode::TRUNC,
        });
        roundtrip(Tmessage::Create {
            fid: 1,
            name: long,
            perm: 0o644,
            mode: OpenMode::WRITE,
        });
        roundtrip(Tmessage::Read {
            fid: 1,
            offset: u64::MAX,
            count: 8168,
        });
        roundtrip(Tmessage::Write {
            fid: 1,
            offset: 0,
            data: Bytes::new(),
        });
        roundtrip(Tmessage::Write {
            fid: 1,
            offset: 10,
            data: Bytes::from_static(b"payload"),
        });
        roundtrip(Tmessage::Clunk { fid: 1 });
        roundtrip(Tmessage::Remove { fid: 2 });
        roundtrip(Tmessage::Stat { fid: 3 });
        roundtrip(Tmessage::Wstat {
            fid: 4,
            stat: sample_stat(),
        });
    }

    #[test]
    fn test_tversion_exact_bytes() {
        let bytes = encode_request(
            0,
            &Tmessage::Version {
                msize: 8192,
                version: VERSION_9P2000.into(),
            },
        )
        .unwrap();
        let expected: &[u8] = &[
            19, 0, 0, 0, // size
            100, // Tversion
            0, 0, // tag
            0x00, 0x20, 0, 0, // msize 8192
            6, 0, b'9', b'P', b'2', b'0', b'0', b'0',
        ];
        assert_eq!(&bytes[..], expected);
    }

    #[test]
    fn test_empty_string_not_omitted() {
        let bytes = encode_request(
            1,
            &Tmessage::Attach {
                fid: 0,
                afid: NOFID,
                uname: String::new(),
                aname: String::new(),
            },
        )
        .unwrap();
        // header + fid + afid + two zero-length strings
        assert_eq!(bytes.len(), HEADER_SIZE + 4 + 4 + 2 + 2);
        assert_eq!(&bytes[bytes.len() - 4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_walk_too_many_elements_rejected() {
        let msg = Tmessage::Walk {
            fid: 0,
            newfid: 1,
            wnames: vec!["a".to_string(); MAXWELEM + 1],
        };
        assert!(matches!(
            encode_request(1, &msg),
            Err(NineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_response_decode_read_shares_buffer() {
        let raw = encode_response(
            3,
            &Rmessage::Read {
                data: Bytes::from_static(b"hello"),
            },
        )
        .unwrap();
        let (header, msg) = decode_response(&raw).unwrap();
        assert_eq!(header.tag, 3);
        match msg {
            Rmessage::Read { data } => {
                assert_eq!(&data[..], b"hello");
                assert_eq!(data.as_ptr(), raw[HEADER_SIZE + 4..].as_ptr());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_response_decode_all_kinds() {
        let qid = Qid::new(QidType::empty(), 1, 2);
        let cases = vec![
            Rmessage::Version {
                msize: 4096,
                version: VERSION_9P2000.into(),
            },
            Rmessage::Auth { aqid: qid },
            Rmessage::Attach { qid },
            Rmessage::Error {
                ename: "permission denied".into(),
            },
            Rmessage::Flush,
            Rmessage::Walk {
                wqids: vec![qid, qid],
            },
            Rmessage::Open { qid, iounit: 0 },
            Rmessage::Create { qid, iounit: 512 },
            Rmessage::Write { count: 9 },
            Rmessage::Clunk,
            Rmessage::Remove,
            Rmessage::Stat {
                stat: sample_stat(),
            },
            Rmessage::Wstat,
        ];
        for msg in cases {
            let raw = encode_response(8, &msg).unwrap();
            let (header, decoded) = decode_response(&raw).unwrap();
            assert_eq!(header.tag, 8);
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_rerror_never_decoded_as_success() {
        // Rerror body that would also parse as a 4-byte Rwrite count
        let raw = encode_response(2, &Rmessage::Error { ename: "no".into() }).unwrap();
        assert_eq!(raw.len(), HEADER_SIZE + 4);
        let (_, msg) = decode_response(&raw).unwrap();
        assert_eq!(msg, Rmessage::Error { ename: "no".into() });
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut raw = encode_response(1, &Rmessage::Clunk).unwrap().to_vec();
        raw.push(0);
        raw[0] += 1;
        let raw = Bytes::from(raw);
        assert!(matches!(decode_response(&raw), Err(NineError::Decode(_))));
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let raw = encode_request(1, &Tmessage::Clunk { fid: 1 }).unwrap();
        assert!(matches!(
            decode_request(&raw[..raw.len() - 1]),
            Err(NineError::Decode(_))
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let raw = Bytes::from_static(&[7, 0, 0, 0, 200, 0, 0]);
        assert!(matches!(
            decode_response(&raw),
            Err(NineError::UnknownType(200))
        ));
    }

    #[test]
    fn test_request_type_is_not_a_response() {
        let raw = encode_request(1, &Tmessage::Clunk { fid: 1 }).unwrap();
        assert!(matches!(decode_response(&raw), Err(NineError::Decode(_))));
    }

    #[test]
    fn test_wstat_count_field_never_wraps() {
        let largest = Stat {
            name: "n".repeat(Stat::MAX_SIZE - 47),
            ..Stat::default()
        }
        .sized();
        let bytes = encode_request(2, &Tmessage::Wstat { fid: 1, stat: largest.clone() }).unwrap();
        assert_eq!(u16::from_le_bytes([bytes[11], bytes[12]]), u16::MAX);
        let (_, decoded) = decode_request(&bytes).unwrap();
        assert_eq!(decoded, Tmessage::Wstat { fid: 1, stat: largest });

        let oversized = Stat {
            name: "n".repeat(Stat::MAX_SIZE - 46),
            ..Stat::default()
        };
        assert!(matches!(
            encode_request(2, &Tmessage::Wstat { fid: 1, stat: oversized.clone() }),
            Err(NineError::InvalidArgument(_))
        ));
        assert!(matches!(
            encode_response(2, &Rmessage::Stat { stat: oversized }),
            Err(NineError::InvalidArgument(_))
        ));
    }
}
