//! Search filter parsing.
//!
//! Transforms the string representation of a search filter (RFC 4515) into
//! the BER structure carried by a Search request. Extensible-match filters
//! are not supported.

use lber::common::TagClass;
use lber::structures::{ExplicitTag, OctetString, Sequence, Tag};

use nom::branch::alt;
use nom::bytes::complete::{tag as sym, take_while, take_while1};
use nom::character::complete::char;
use nom::combinator::{all_consuming, map, map_opt};
use nom::multi::many1;
use nom::sequence::{delimited, pair, preceded};
use nom::IResult;

use crate::result::LdapError;

const AND_FILT: u64 = 0;
const OR_FILT: u64 = 1;
const NOT_FILT: u64 = 2;

const EQ_MATCH: u64 = 3;
const SUBSTR_MATCH: u64 = 4;
const GTE_MATCH: u64 = 5;
const LTE_MATCH: u64 = 6;
const PRES_MATCH: u64 = 7;
const APPROX_MATCH: u64 = 8;

const SUB_INITIAL: u64 = 0;
const SUB_ANY: u64 = 1;
const SUB_FINAL: u64 = 2;

/// Parse a filter string into the structure used in a Search request.
pub fn parse(input: &str) -> Result<Tag, LdapError> {
    match all_consuming(filtexpr)(input) {
        Ok((_, tag)) => Ok(tag),
        Err(_) => Err(LdapError::FilterParsing),
    }
}

fn filtexpr(i: &str) -> IResult<&str, Tag> {
    alt((filter, item))(i)
}

fn filter(i: &str) -> IResult<&str, Tag> {
    delimited(char('('), filtercomp, char(')'))(i)
}

fn filtercomp(i: &str) -> IResult<&str, Tag> {
    alt((and, or, not, item))(i)
}

fn and(i: &str) -> IResult<&str, Tag> {
    map(preceded(char('&'), many1(filter)), |inner| {
        set_filter(AND_FILT, inner)
    })(i)
}

fn or(i: &str) -> IResult<&str, Tag> {
    map(preceded(char('|'), many1(filter)), |inner| {
        set_filter(OR_FILT, inner)
    })(i)
}

fn not(i: &str) -> IResult<&str, Tag> {
    map(preceded(char('!'), filter), |inner| {
        Tag::ExplicitTag(ExplicitTag {
            class: TagClass::Context,
            id: NOT_FILT,
            inner: Box::new(inner),
        })
    })(i)
}

fn set_filter(id: u64, inner: Vec<Tag>) -> Tag {
    Tag::Sequence(Sequence {
        class: TagClass::Context,
        id,
        inner,
    })
}

fn item(i: &str) -> IResult<&str, Tag> {
    map_opt(
        pair(attr_desc, pair(match_op, raw_value)),
        |(attr, (op, raw))| assemble_item(attr, op, raw),
    )(i)
}

fn attr_desc(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == ';')(i)
}

fn match_op(i: &str) -> IResult<&str, u64> {
    alt((
        map(sym("~="), |_| APPROX_MATCH),
        map(sym(">="), |_| GTE_MATCH),
        map(sym("<="), |_| LTE_MATCH),
        map(sym("="), |_| EQ_MATCH),
    ))(i)
}

fn raw_value(i: &str) -> IResult<&str, &str> {
    take_while(|c: char| c != '(' && c != ')')(i)
}

fn assemble_item(attr: &str, op: u64, raw: &str) -> Option<Tag> {
    if op == EQ_MATCH {
        if raw == "*" {
            return Some(Tag::OctetString(OctetString {
                class: TagClass::Context,
                id: PRES_MATCH,
                inner: Vec::from(attr.as_bytes()),
            }));
        }
        let mut parts = split_value(raw)?;
        if parts.len() == 1 {
            return parts.pop().map(|value| match_tag(EQ_MATCH, attr, value));
        }
        return substrings(attr, parts);
    }
    // a literal '*' in a non-substring assertion must be escaped
    let mut parts = split_value(raw)?;
    if parts.len() != 1 {
        return None;
    }
    parts.pop().map(|value| match_tag(op, attr, value))
}

fn substrings(attr: &str, parts: Vec<Vec<u8>>) -> Option<Tag> {
    let last = parts.len() - 1;
    let mut subs = Vec::new();
    for (i, part) in parts.into_iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        let id = match i {
            0 => SUB_INITIAL,
            i if i == last => SUB_FINAL,
            _ => SUB_ANY,
        };
        subs.push(Tag::OctetString(OctetString {
            class: TagClass::Context,
            id,
            inner: part,
        }));
    }
    if subs.is_empty() {
        return None;
    }
    Some(Tag::Sequence(Sequence {
        class: TagClass::Context,
        id: SUBSTR_MATCH,
        inner: vec![
            Tag::OctetString(OctetString {
                inner: Vec::from(attr.as_bytes()),
                ..Default::default()
            }),
            Tag::Sequence(Sequence {
                inner: subs,
                ..Default::default()
            }),
        ],
    }))
}

fn match_tag(id: u64, attr: &str, value: Vec<u8>) -> Tag {
    Tag::Sequence(Sequence {
        class: TagClass::Context,
        id,
        inner: vec![
            Tag::OctetString(OctetString {
                inner: Vec::from(attr.as_bytes()),
                ..Default::default()
            }),
            Tag::OctetString(OctetString {
                inner: value,
                ..Default::default()
            }),
        ],
    })
}

/// Split an assertion value on unescaped stars, decoding `\XX` escapes.
/// `None` on a malformed escape sequence.
fn split_value(raw: &str) -> Option<Vec<Vec<u8>>> {
    let bytes = raw.as_bytes();
    let mut parts = vec![Vec::new()];
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'*' => {
                parts.push(Vec::new());
                i += 1;
            }
            b'\\' => {
                let hi = hex_digit(*bytes.get(i + 1)?)?;
                let lo = hex_digit(*bytes.get(i + 2)?)?;
                parts.last_mut()?.push(hi << 4 | lo);
                i += 3;
            }
            c => {
                parts.last_mut()?.push(c);
                i += 1;
            }
        }
    }
    Some(parts)
}

fn hex_digit(c: u8) -> Option<u8> {
    (c as char).to_digit(16).map(|d| d as u8)
}

#[cfg(test)]
mod test {
    use super::*;
    use lber::structure::PL;
    use lber::structures::ASNTag;

    #[test]
    fn presence() {
        let t = parse("(objectClass=*)").expect("parse").into_structure();
        assert_eq!(t.class, TagClass::Context);
        assert_eq!(t.id, PRES_MATCH);
        assert_eq!(t.payload, PL::P(Vec::from("objectClass")));
    }

    #[test]
    fn equality() {
        let t = parse("(sn=Smith)").expect("parse").into_structure();
        assert_eq!(t.id, EQ_MATCH);
        match t.payload {
            PL::C(parts) => {
                assert_eq!(parts[0].clone().expect_primitive(), Some(Vec::from("sn")));
                assert_eq!(parts[1].clone().expect_primitive(), Some(Vec::from("Smith")));
            }
            _ => panic!("equality filter must be constructed"),
        }
    }

    #[test]
    fn boolean_composition() {
        let t = parse("(&(objectClass=person)(!(sn=Smith))(|(cn=a)(cn=b)))")
            .expect("parse")
            .into_structure();
        assert_eq!(t.id, AND_FILT);
        match t.payload {
            PL::C(parts) => {
                assert_eq!(parts.len(), 3);
                assert_eq!(parts[1].id, NOT_FILT);
                assert_eq!(parts[2].id, OR_FILT);
            }
            _ => panic!("AND filter must be constructed"),
        }
    }

    #[test]
    fn substrings_split() {
        let t = parse("(cn=foo*bar*baz)").expect("parse").into_structure();
        assert_eq!(t.id, SUBSTR_MATCH);
        let parts = match t.payload {
            PL::C(parts) => parts,
            _ => panic!("substring filter must be constructed"),
        };
        let subs = match parts[1].clone().payload {
            PL::C(subs) => subs,
            _ => panic!("substrings must be constructed"),
        };
        let ids: Vec<u64> = subs.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![SUB_INITIAL, SUB_ANY, SUB_FINAL]);
    }

    #[test]
    fn trailing_star_has_no_final() {
        let t = parse("(cn=foo*)").expect("parse").into_structure();
        assert_eq!(t.id, SUBSTR_MATCH);
        let parts = match t.payload {
            PL::C(parts) => parts,
            _ => panic!("substring filter must be constructed"),
        };
        let subs = match parts[1].clone().payload {
            PL::C(subs) => subs,
            _ => panic!("substrings must be constructed"),
        };
        let ids: Vec<u64> = subs.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![SUB_INITIAL]);
    }

    #[test]
    fn escapes_decode() {
        let t = parse("(cn=a\\2ab)").expect("parse").into_structure();
        assert_eq!(t.id, EQ_MATCH);
        match t.payload {
            PL::C(parts) => {
                assert_eq!(parts[1].clone().expect_primitive(), Some(Vec::from("a*b")));
            }
            _ => panic!("equality filter must be constructed"),
        }
    }

    #[test]
    fn ordering_matches() {
        assert_eq!(
            parse("(uidNumber>=1000)").expect("parse").into_structure().id,
            GTE_MATCH
        );
        assert_eq!(
            parse("(uidNumber<=1000)").expect("parse").into_structure().id,
            LTE_MATCH
        );
        assert_eq!(
            parse("(cn~=smith)").expect("parse").into_structure().id,
            APPROX_MATCH
        );
    }

    #[test]
    fn malformed_filters_are_rejected(){
        assert!(parse("(cn=").is_err());
        assert!(parse("(&)").is_err());
        assert!(parse("(cn=a\\2)").is_err());
        assert!(parse("no=parens)").is_err());
    }
}
