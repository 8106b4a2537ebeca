//! Scripted-server plumbing for the integration tests.
//!
//! The tests play the server side of the protocol over a real TCP socket:
//! frames from the client are parsed with the crate's `asn1` re-exports,
//! and canned responses are written back byte-for-byte as a directory
//! server would.

use bytes::BytesMut;
use ldapmux::asn1::{
    parse_tag, parse_uint, write, ASNTag, Enumerated, Integer, OctetString, Sequence, Set,
    StructureTag, Tag, TagClass, Types, PL,
};
use ldapmux::controls::{ControlParser, PagedResults, RawControl, PAGED_RESULTS_OID};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub struct Frame {
    pub msgid: i32,
    pub op: StructureTag,
    pub controls: Option<StructureTag>,
}

/// Read one LDAPMessage from the client.
pub async fn read_frame(sock: &mut TcpStream, buf: &mut BytesMut) -> Frame {
    loop {
        if !buf.is_empty() {
            let parsed = match parse_tag(&buf[..]) {
                Ok((rest, tag)) => Some((buf.len() - rest.len(), tag)),
                Err(nom::Err::Incomplete(_)) => None,
                Err(_) => panic!("malformed frame from client"),
            };
            if let Some((consumed, tag)) = parsed {
                let _ = buf.split_to(consumed);
                return unpack(tag);
            }
        }
        let n = sock.read_buf(buf).await.expect("server read");
        assert!(n > 0, "client closed the connection mid-frame");
    }
}

fn unpack(tag: StructureTag) -> Frame {
    let tags = tag
        .match_id(Types::Sequence as u64)
        .and_then(|t| t.expect_constructed())
        .expect("message sequence");
    let mut tags = tags.into_iter();
    let id_bytes = tags
        .next()
        .expect("message id")
        .expect_primitive()
        .expect("primitive id");
    let msgid = match parse_uint(&id_bytes) {
        Ok((_, id)) => id as i32,
        _ => panic!("unparseable message id"),
    };
    let op = tags.next().expect("protocol op");
    let controls = tags.next();
    Frame {
        msgid,
        op,
        controls,
    }
}

/// The paging cookie of the request's Paged Results control, if any.
pub fn request_cookie(frame: &Frame) -> Option<Vec<u8>> {
    let ctrls = frame.controls.clone()?.expect_constructed()?;
    for ctrl in ctrls {
        let mut parts = ctrl.expect_constructed()?.into_iter();
        let oid = String::from_utf8(parts.next()?.expect_primitive()?).ok()?;
        if oid != PAGED_RESULTS_OID {
            continue;
        }
        for part in parts {
            if part.id == Types::OctetString as u64 {
                let val = part.expect_primitive()?;
                return Some(PagedResults::parse(&val).cookie);
            }
        }
    }
    None
}

/// Write one LDAPMessage to the client.
pub async fn send_frame(
    sock: &mut TcpStream,
    msgid: i32,
    op: Tag,
    controls: Option<Vec<StructureTag>>,
) {
    let mut inner = vec![
        Tag::Integer(Integer {
            inner: msgid as i64,
            ..Default::default()
        }),
        op,
    ];
    if let Some(ctrls) = controls {
        inner.push(Tag::StructureTag(StructureTag {
            id: 0,
            class: TagClass::Context,
            payload: PL::C(ctrls),
        }));
    }
    let msg = Tag::Sequence(Sequence {
        inner,
        ..Default::default()
    })
    .into_structure();
    let mut buf = BytesMut::new();
    write::encode_into(&mut buf, msg).expect("encode frame");
    sock.write_all(&buf).await.expect("server write");
}

/// An LDAPResult-shaped response op with the given application tag.
pub fn result_op(op_id: u64, rc: i64) -> Tag {
    Tag::Sequence(Sequence {
        id: op_id,
        class: TagClass::Application,
        inner: vec![
            Tag::Enumerated(Enumerated {
                inner: rc,
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: Vec::new(),
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: Vec::new(),
                ..Default::default()
            }),
        ],
    })
}

/// A SearchResultEntry op.
pub fn entry_op(dn: &str, attrs: &[(&str, &[&str])]) -> Tag {
    Tag::Sequence(Sequence {
        id: 4,
        class: TagClass::Application,
        inner: vec![
            Tag::OctetString(OctetString {
                inner: Vec::from(dn.as_bytes()),
                ..Default::default()
            }),
            Tag::Sequence(Sequence {
                inner: attrs
                    .iter()
                    .map(|(name, vals)| {
                        Tag::Sequence(Sequence {
                            inner: vec![
                                Tag::OctetString(OctetString {
                                    inner: Vec::from(name.as_bytes()),
                                    ..Default::default()
                                }),
                                Tag::Set(Set {
                                    inner: vals
                                        .iter()
                                        .map(|v| {
                                            Tag::OctetString(OctetString {
                                                inner: Vec::from(v.as_bytes()),
                                                ..Default::default()
                                            })
                                        })
                                        .collect(),
                                    ..Default::default()
                                }),
                            ],
                            ..Default::default()
                        })
                    })
                    .collect(),
                ..Default::default()
            }),
        ],
    })
}

/// The response control list for one page of a paged search.
pub fn paged_control(size: i32, cookie: &[u8]) -> Vec<StructureTag> {
    vec![StructureTag::from(RawControl::from(PagedResults {
        size,
        cookie: Vec::from(cookie),
    }))]
}

/// Consume bytes until the client hangs up.
pub async fn drain(mut sock: TcpStream) {
    let mut sink = [0u8; 256];
    loop {
        match sock.read(&mut sink).await {
            Ok(0) | Err(_) => return,
            Ok(_) => (),
        }
    }
}
