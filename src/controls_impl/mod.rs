use std::collections::HashMap;

use lber::common::TagClass;
use lber::structure::{StructureTag, PL};
use lber::structures::{ASNTag, Boolean, OctetString, Sequence, Tag};
use lber::universal::Types;

pub mod types {
    //! Recognized control types.
    //!
    //! The enum is non-exhaustive by construction: matching on a parsed
    //! control must always have a catch-all arm, since the set of controls
    //! recognized by the library is expected to grow.
    pub type ControlType = self::inner::_ControlType;
    pub use self::inner::_ControlType::PagedResults;
    mod inner {
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        pub enum _ControlType {
            PagedResults,
            #[doc(hidden)]
            _Nonexhaustive,
        }
    }
}
use self::types::ControlType;

mod paged_results;
pub use self::paged_results::{PagedResults, PAGED_RESULTS_OID};

lazy_static! {
    static ref CONTROLS: HashMap<&'static str, ControlType> = {
        let mut map = HashMap::new();
        map.insert(PAGED_RESULTS_OID, types::PagedResults);
        map
    };
}

/// Mark a control as critical.
///
/// Most controls provided by this library implement this trait. All controls
/// are instantiated as non-critical by default, unless dictated otherwise by
/// their specification.
pub trait MakeCritical {
    /// Mark the control instance as critical. This operation consumes the
    /// control, and is irreversible.
    fn critical(self) -> CriticalControl<Self>
    where
        Self: Sized,
    {
        CriticalControl { control: self }
    }
}

/// Wrapper for a control marked as critical.
pub struct CriticalControl<T> {
    control: T,
}

impl<T> From<CriticalControl<T>> for RawControl
where
    T: Into<RawControl>,
{
    fn from(cc: CriticalControl<T>) -> RawControl {
        let mut ctrl = cc.control.into();
        ctrl.crit = true;
        ctrl
    }
}

/// Conversion trait for control values.
///
/// The generic parsing of response control values only extracts the raw
/// bytes; a recognized control must implement this trait to further parse
/// them into a control-specific struct.
pub trait ControlParser {
    /// Parse the raw BER value into a control-specific struct.
    fn parse(val: &[u8]) -> Self;
}

/// Response control destructured into its type marker and raw content.
///
/// The first element has a value if the parser recognizes the control's OID
/// as one implemented by the library itself.
#[derive(Clone, Debug)]
pub struct Control(pub Option<ControlType>, pub RawControl);

/// Generic request or response control.
#[derive(Clone, Debug)]
pub struct RawControl {
    /// OID of the control.
    pub ctype: String,
    /// Criticality; off by default.
    pub crit: bool,
    /// Raw value of the control, if any.
    pub val: Option<Vec<u8>>,
}

impl RawControl {
    /// Parse the raw value of the control into a control-specific struct.
    ///
    /// The caller must make sure that the control is of the expected type.
    pub fn parse<T: ControlParser>(&self) -> T {
        T::parse(self.val.as_ref().expect("control value"))
    }
}

impl From<RawControl> for StructureTag {
    fn from(ctrl: RawControl) -> StructureTag {
        construct_control(&ctrl.ctype, ctrl.crit, ctrl.val)
    }
}

pub(crate) fn construct_control(oid: &str, crit: bool, val: Option<Vec<u8>>) -> StructureTag {
    let mut seq = vec![Tag::OctetString(OctetString {
        inner: Vec::from(oid.as_bytes()),
        ..Default::default()
    })];
    if crit {
        seq.push(Tag::Boolean(Boolean {
            inner: true,
            ..Default::default()
        }));
    }
    if let Some(val) = val {
        seq.push(Tag::OctetString(OctetString {
            inner: val,
            ..Default::default()
        }));
    }
    Tag::Sequence(Sequence {
        inner: seq,
        ..Default::default()
    })
    .into_structure()
}

pub(crate) fn parse_controls(t: StructureTag) -> Vec<Control> {
    let tags = t.expect_constructed().expect("controls sequence").into_iter();
    let mut ctrls = Vec::new();
    for ctrl in tags {
        let mut components = ctrl.expect_constructed().expect("control components").into_iter();
        let ctype = String::from_utf8(
            components
                .next()
                .expect("control type")
                .expect_primitive()
                .expect("octet string"),
        )
        .expect("control type utf8");
        let next = components.next();
        let (crit, maybe_val) = match next {
            None => (false, None),
            Some(c) => match c {
                StructureTag {
                    id,
                    class: _,
                    ref payload,
                } if id == Types::Boolean as u64 => match *payload {
                    PL::P(ref v) => (v[0] != 0, components.next()),
                    PL::C(_) => panic!("decoding error"),
                },
                StructureTag { id, .. } if id == Types::OctetString as u64 => (false, Some(c)),
                _ => panic!("decoding error"),
            },
        };
        let val = maybe_val.map(|v| v.expect_primitive().expect("octet string"));
        let known = CONTROLS.get(&*ctype).copied();
        ctrls.push(Control(known, RawControl { ctype, crit, val }));
    }
    ctrls
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn control_round_trip_with_criticality() {
        let raw = RawControl {
            ctype: PAGED_RESULTS_OID.to_owned(),
            crit: true,
            val: Some(vec![1, 2, 3]),
        };
        let seq = StructureTag {
            id: 0,
            class: TagClass::Context,
            payload: PL::C(vec![StructureTag::from(raw)]),
        };
        let parsed = parse_controls(seq);
        assert_eq!(parsed.len(), 1);
        let Control(ctype, ref raw) = parsed[0];
        assert_eq!(ctype, Some(types::PagedResults));
        assert!(raw.crit);
        assert_eq!(raw.val.as_deref(), Some(&[1u8, 2, 3][..]));
    }
}
