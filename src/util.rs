use std::borrow::Cow;

fn hex_escape(out: &mut Vec<u8>, c: u8) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    out.push(b'\\');
    out.push(HEX[(c >> 4) as usize]);
    out.push(HEX[(c & 0xF) as usize]);
}

fn escape_by<'a, S, F>(lit: S, needs_escape: F) -> Cow<'a, str>
where
    S: Into<Cow<'a, str>>,
    F: Fn(usize, usize, u8) -> bool,
{
    let lit = lit.into();
    let len = lit.len();
    let mut out: Option<Vec<u8>> = None;
    for (i, &c) in lit.as_bytes().iter().enumerate() {
        if needs_escape(i, len, c) {
            let out = out.get_or_insert_with(|| {
                let mut v = Vec::with_capacity(len + 12);
                v.extend(lit[..i].as_bytes());
                v
            });
            hex_escape(out, c);
        } else if let Some(ref mut out) = out {
            out.push(c);
        }
    }
    match out {
        // unchecked conversion is safe here: the input is valid UTF-8 by
        // definition, and single ASCII bytes are only ever replaced with
        // ASCII byte sequences
        Some(out) => Cow::Owned(unsafe { String::from_utf8_unchecked(out) }),
        None => lit,
    }
}

/// Escape a filter literal.
///
/// Literal values appearing in a search filter can contain any character,
/// but some characters (parentheses, asterisk, backslash, NUL) must be
/// escaped in the filter's string representation. This function does the
/// escaping.
///
/// The argument, `lit`, can be owned or borrowed. The function doesn't
/// allocate the return value unless there's need to escape the input.
pub fn ldap_escape<'a, S: Into<Cow<'a, str>>>(lit: S) -> Cow<'a, str> {
    escape_by(lit, |_, _, c| {
        matches!(c, b'\\' | b'*' | b'(' | b')' | 0)
    })
}

/// Escape an attribute value in a relative distinguished name.
///
/// When a literal string is used to represent an attribute value in an RDN,
/// some of its characters must be escaped per RFC 4514: the special
/// characters `"`, `+`, `,`, `;`, `<`, `>`, `\`, and NUL anywhere in the
/// string, `#` and space at the beginning, and space at the end.
///
/// The argument, `val`, can be owned or borrowed. The function doesn't
/// allocate the return value unless there's need to escape the input.
pub fn dn_escape<'a, S: Into<Cow<'a, str>>>(val: S) -> Cow<'a, str> {
    escape_by(val, |i, len, c| {
        matches!(c, b'"' | b'+' | b',' | b';' | b'<' | b'>' | b'\\' | 0)
            || (i == 0 && (c == b'#' || c == b' '))
            || (i == len - 1 && c == b' ')
    })
}

/// Split a DN string at the first unescaped comma, yielding the leading RDN
/// and the remainder, if any.
pub(crate) fn split_dn_once(dn: &str) -> (&str, Option<&str>) {
    let mut escaped = false;
    for (i, c) in dn.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            ',' => return (&dn[..i], Some(&dn[i + 1..])),
            _ => (),
        }
    }
    (dn, None)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filter_escape() {
        assert_eq!(ldap_escape("nothing"), "nothing");
        assert_eq!(ldap_escape("a*b"), "a\\2ab");
        assert_eq!(ldap_escape("(cn)"), "\\28cn\\29");
        assert_eq!(ldap_escape("back\\slash"), "back\\5cslash");
    }

    #[test]
    fn rdn_escape() {
        assert_eq!(dn_escape("Babs Jensen"), "Babs Jensen");
        assert_eq!(dn_escape("a,b"), "a\\2cb");
        assert_eq!(dn_escape(" leading"), "\\20leading");
        assert_eq!(dn_escape("#leading"), "\\23leading");
        assert_eq!(dn_escape("trailing "), "trailing\\20");
    }

    #[test]
    fn dn_split() {
        assert_eq!(split_dn_once("cn=a"), ("cn=a", None));
        assert_eq!(
            split_dn_once("cn=a,ou=b,dc=c"),
            ("cn=a", Some("ou=b,dc=c"))
        );
        assert_eq!(
            split_dn_once("cn=a\\,b,dc=c"),
            ("cn=a\\,b", Some("dc=c"))
        );
    }
}
