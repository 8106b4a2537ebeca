//! LDAPMessage framing and envelope (de)construction.
//!
//! `LdapCodec` turns the raw byte stream into parsed LDAPMessage envelopes
//! and back. Framing is delegated to lber: an incomplete BER element leaves
//! the buffer untouched until more bytes arrive, while a malformed one is a
//! protocol error, which the connection driver treats as fatal.

use bytes::BytesMut;
use lber::common::TagClass;
use lber::parse::{parse_tag, parse_uint};
use lber::structure::{StructureTag, PL};
use lber::structures::{ASNTag, Integer, Sequence, Tag};
use lber::universal::Types;
use lber::write;
use log::trace;
use nom::Err as NomErr;
use tokio_util::codec::{Decoder, Encoder};

use crate::exop::Exop;
use crate::result::{LdapError, LdapResult};
use crate::search::parse_refs;
use crate::RequestId;

/// A parsed inbound message: ID, protocol op, raw response controls.
pub(crate) type WireMessage = (RequestId, (Tag, Option<StructureTag>));

/// An outbound message: ID, protocol op, encoded request controls.
pub(crate) type WireRequest = (RequestId, Tag, Option<Vec<StructureTag>>);

pub(crate) struct LdapCodec;

impl Decoder for LdapCodec {
    type Item = WireMessage;
    type Error = LdapError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<WireMessage>, LdapError> {
        let (consumed, tag) = match parse_tag(&buf[..]) {
            Ok((rest, tag)) => (buf.len() - rest.len(), tag),
            Err(NomErr::Incomplete(_)) => return Ok(None),
            Err(_) => return Err(LdapError::Protocol("BER framing error")),
        };
        let _ = buf.split_to(consumed);
        let mut tags = tag
            .match_id(Types::Sequence as u64)
            .and_then(|t| t.expect_constructed())
            .ok_or(LdapError::Protocol("LDAPMessage is not a sequence"))?;
        let maybe_controls = tags
            .pop()
            .ok_or(LdapError::Protocol("empty LDAPMessage sequence"))?;
        let has_controls = match maybe_controls {
            StructureTag {
                id: 0,
                class: TagClass::Context,
                ref payload,
            } => match *payload {
                PL::C(_) => true,
                PL::P(_) => return Err(LdapError::Protocol("malformed response controls")),
            },
            _ => false,
        };
        let (protoop, controls) = if has_controls {
            let op = tags
                .pop()
                .ok_or(LdapError::Protocol("LDAPMessage without protocol op"))?;
            (op, Some(maybe_controls))
        } else {
            (maybe_controls, None)
        };
        let id_bytes = tags
            .pop()
            .and_then(|t| t.match_class(TagClass::Universal))
            .and_then(|t| t.match_id(Types::Integer as u64))
            .and_then(|t| t.expect_primitive())
            .ok_or(LdapError::Protocol("LDAPMessage without message ID"))?;
        let id = match parse_uint(id_bytes.as_slice()) {
            Ok((_, id)) => id as RequestId,
            _ => return Err(LdapError::Protocol("unparseable message ID")),
        };
        trace!("received msgid={} op={}", id, protoop.id);
        Ok(Some((id, (Tag::StructureTag(protoop), controls))))
    }
}

impl Encoder<WireRequest> for LdapCodec {
    type Error = LdapError;

    fn encode(&mut self, msg: WireRequest, buf: &mut BytesMut) -> Result<(), LdapError> {
        let (id, op, controls) = msg;
        let mut inner = vec![
            Tag::Integer(Integer {
                inner: id as i64,
                ..Default::default()
            }),
            op,
        ];
        if let Some(controls) = controls {
            inner.push(Tag::StructureTag(StructureTag {
                id: 0,
                class: TagClass::Context,
                payload: PL::C(controls),
            }));
        }
        let outstruct = Tag::Sequence(Sequence {
            inner,
            ..Default::default()
        })
        .into_structure();
        trace!("sending packet: {:?}", &outstruct);
        write::encode_into(buf, outstruct)?;
        Ok(())
    }
}

/// LDAPResult components together with the extended-response payload, which
/// shares the same sequence on the wire.
pub(crate) struct LdapResultExt(pub LdapResult, pub Exop);

impl From<Tag> for LdapResultExt {
    fn from(t: Tag) -> LdapResultExt {
        let t = match t {
            Tag::StructureTag(t) => t,
            Tag::Null(_) => {
                return LdapResultExt(
                    LdapResult {
                        rc: 0,
                        ..Default::default()
                    },
                    Exop {
                        name: None,
                        val: None,
                    },
                )
            }
            _ => unimplemented!("result from a non-response tag"),
        };
        let mut tags = t
            .expect_constructed()
            .expect("result sequence")
            .into_iter();
        let rc = match parse_uint(
            tags.next()
                .expect("result code")
                .match_class(TagClass::Universal)
                .and_then(|t| t.match_id(Types::Enumerated as u64))
                .and_then(|t| t.expect_primitive())
                .expect("result code value")
                .as_slice(),
        ) {
            Ok((_, rc)) => rc as u32,
            _ => panic!("failed to parse result code"),
        };
        let matched = String::from_utf8(
            tags.next()
                .expect("matched DN")
                .expect_primitive()
                .expect("octet string"),
        )
        .expect("matched DN utf8");
        let text = String::from_utf8(
            tags.next()
                .expect("diagnostic message")
                .expect_primitive()
                .expect("octet string"),
        )
        .expect("diagnostic message utf8");
        let mut refs = Vec::new();
        let mut exop_name = None;
        let mut exop_val = None;
        for tag in tags {
            match tag.id {
                // referral URIs
                3 => refs.extend(parse_refs(tag)),
                // extended response name and value
                10 => {
                    exop_name = Some(
                        String::from_utf8(tag.expect_primitive().expect("octet string"))
                            .expect("response name utf8"),
                    )
                }
                11 => exop_val = tag.expect_primitive(),
                _ => (),
            }
        }
        LdapResultExt(
            LdapResult {
                rc,
                matched,
                text,
                refs,
                ctrls: vec![],
            },
            Exop {
                name: exop_name,
                val: exop_val,
            },
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use lber::structures::OctetString;

    fn bind_response(rc: i64) -> Tag {
        Tag::Sequence(Sequence {
            id: 1,
            class: TagClass::Application,
            inner: vec![
                Tag::Enumerated(lber::structures::Enumerated {
                    inner: rc,
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: Vec::new(),
                    ..Default::default()
                }),
                Tag::OctetString(OctetString {
                    inner: Vec::from("ok"),
                    ..Default::default()
                }),
            ],
        })
    }

    #[test]
    fn envelope_round_trip() {
        let mut codec = LdapCodec;
        let mut buf = BytesMut::new();
        codec
            .encode((7, bind_response(0), None), &mut buf)
            .expect("encode");
        let (id, (op, controls)) = codec
            .decode(&mut buf)
            .expect("decode")
            .expect("a full frame");
        assert_eq!(id, 7);
        assert!(controls.is_none());
        assert!(buf.is_empty());
        let ext = LdapResultExt::from(op);
        assert_eq!(ext.0.rc, 0);
        assert_eq!(ext.0.text, "ok");
    }

    #[test]
    fn partial_frame_waits_for_more_input() {
        let mut codec = LdapCodec;
        let mut buf = BytesMut::new();
        codec
            .encode((1, bind_response(49), None), &mut buf)
            .expect("encode");
        let full = buf.clone();
        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut partial).expect("no error").is_none());
        partial.extend_from_slice(&full[full.len() - 3..]);
        let (id, (op, _)) = codec
            .decode(&mut partial)
            .expect("decode")
            .expect("a full frame");
        assert_eq!(id, 1);
        let ext = LdapResultExt::from(op);
        assert_eq!(ext.0.rc, 49);
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut codec = LdapCodec;
        let mut buf = BytesMut::new();
        codec
            .encode((1, bind_response(0), None), &mut buf)
            .expect("encode");
        codec
            .encode((2, bind_response(0), None), &mut buf)
            .expect("encode");
        let (first, _) = codec.decode(&mut buf).expect("decode").expect("frame");
        let (second, _) = codec.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!((first, second), (1, 2));
        assert!(codec.decode(&mut buf).expect("no error").is_none());
    }
}
