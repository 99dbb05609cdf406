//! HMS component identifiers ("xnames").
//!
//! An xname is a sequence of `<letter><number>` segments, e.g. `x3000c0s7b0n1`
//! for node 1 behind BMC 0 in slot 7 of chassis 0 in cabinet 3000. The letter
//! sequence alone decides the component type, so validation parses the
//! segments and looks the letter sequence up in a fixed table.

use std::fmt;
use std::str::FromStr;

use crate::ModelError;

/// Largest value accepted for any numeric segment.
const MAX_ORDINAL: u32 = 999_999;

/// Component type named by an xname.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XnameKind {
    System,
    Cabinet,
    CabinetBmc,
    CabinetCec,
    CabinetPduController,
    CabinetPdu,
    CabinetPduOutlet,
    Chassis,
    ChassisBmc,
    ComputeModule,
    NodeEnclosure,
    NodePowerConnector,
    NodeBmc,
    Node,
    Processor,
    Memory,
    NodeAccel,
    NodeNic,
    NodeHsnNic,
    RouterModule,
    RouterBmc,
    HsnBoard,
    HsnAsic,
    HsnConnector,
    HsnConnectorPort,
    MgmtSwitch,
    MgmtSwitchConnector,
    MgmtHlSwitchEnclosure,
    MgmtHlSwitch,
    Cdu,
    CduMgmtSwitch,
}

/// Letter sequence of each component type, most specific last.
const KINDS: &[(&str, XnameKind)] = &[
    ("s", XnameKind::System),
    ("x", XnameKind::Cabinet),
    ("xb", XnameKind::CabinetBmc),
    ("xe", XnameKind::CabinetCec),
    ("xm", XnameKind::CabinetPduController),
    ("xmp", XnameKind::CabinetPdu),
    ("xmpj", XnameKind::CabinetPduOutlet),
    ("xc", XnameKind::Chassis),
    ("xcb", XnameKind::ChassisBmc),
    ("xcs", XnameKind::ComputeModule),
    ("xcse", XnameKind::NodeEnclosure),
    ("xcsv", XnameKind::NodePowerConnector),
    ("xcsb", XnameKind::NodeBmc),
    ("xcsbn", XnameKind::Node),
    ("xcsbnp", XnameKind::Processor),
    ("xcsbnd", XnameKind::Memory),
    ("xcsbna", XnameKind::NodeAccel),
    ("xcsbni", XnameKind::NodeNic),
    ("xcsbnh", XnameKind::NodeHsnNic),
    ("xcr", XnameKind::RouterModule),
    ("xcrb", XnameKind::RouterBmc),
    ("xcre", XnameKind::HsnBoard),
    ("xcra", XnameKind::HsnAsic),
    ("xcrj", XnameKind::HsnConnector),
    ("xcrjp", XnameKind::HsnConnectorPort),
    ("xcw", XnameKind::MgmtSwitch),
    ("xcwj", XnameKind::MgmtSwitchConnector),
    ("xch", XnameKind::MgmtHlSwitchEnclosure),
    ("xchs", XnameKind::MgmtHlSwitch),
    ("d", XnameKind::Cdu),
    ("dw", XnameKind::CduMgmtSwitch),
];

/// A validated component identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Xname {
    raw: String,
    kind: XnameKind,
    ordinals: Vec<u32>,
}

impl Xname {
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        let invalid = || ModelError::InvalidXname(s.to_string());

        let mut letters = String::new();
        let mut ordinals = Vec::new();
        let mut chars = s.chars().peekable();
        while let Some(c) = chars.next() {
            if !c.is_ascii_lowercase() {
                return Err(invalid());
            }
            letters.push(c);

            let mut digits = String::new();
            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                digits.push(d);
                chars.next();
            }
            let ordinal: u32 = digits.parse().map_err(|_| invalid())?;
            if ordinal > MAX_ORDINAL {
                return Err(invalid());
            }
            ordinals.push(ordinal);
        }

        let kind = KINDS
            .iter()
            .find(|(pattern, _)| *pattern == letters)
            .map(|(_, kind)| *kind)
            .ok_or_else(invalid)?;

        // There is exactly one system.
        if kind == XnameKind::System && ordinals != [0] {
            return Err(invalid());
        }

        Ok(Self {
            raw: s.to_string(),
            kind,
            ordinals,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> XnameKind {
        self.kind
    }

    /// Numeric segments in order, e.g. `[3000, 0, 7, 0, 1]` for `x3000c0s7b0n1`.
    pub fn ordinals(&self) -> &[u32] {
        &self.ordinals
    }

    /// The xname of the enclosing component, if any.
    pub fn parent(&self) -> Option<Xname> {
        let last = self.raw.rfind(|c: char| c.is_ascii_lowercase())?;
        if last == 0 {
            return None;
        }
        Xname::parse(&self.raw[..last]).ok()
    }
}

impl FromStr for Xname {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Xname::parse(s)
    }
}

impl fmt::Display for Xname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Whether `s` is a well-formed HMS component identifier.
pub fn is_valid_xname(s: &str) -> bool {
    Xname::parse(s).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_component_types() {
        let cases = [
            ("s0", XnameKind::System),
            ("x3000", XnameKind::Cabinet),
            ("x0c0", XnameKind::Chassis),
            ("x0c0s1", XnameKind::ComputeModule),
            ("x0c0s1b0", XnameKind::NodeBmc),
            ("x0c0s1b0n0", XnameKind::Node),
            ("x4c1s1b10n4", XnameKind::Node),
            ("x1000c0r3b0", XnameKind::RouterBmc),
            ("x3000m0p1j12", XnameKind::CabinetPduOutlet),
            ("d0w1", XnameKind::CduMgmtSwitch),
        ];
        for (raw, kind) in cases {
            let x = Xname::parse(raw).unwrap_or_else(|e| panic!("{raw}: {e}"));
            assert_eq!(x.kind(), kind, "{raw}");
            assert_eq!(x.as_str(), raw);
        }
    }

    #[test]
    fn rejects_malformed_identifiers() {
        for raw in [
            "", "xyzzy", "x", "x0c", "X0c0", "x0c0s1b0n0z1", "x0c0q1", "s1", "x-1", "x0 c0",
            "0x0", "x9999999",
        ] {
            assert!(!is_valid_xname(raw), "{raw:?} should be invalid");
        }
    }

    #[test]
    fn parent_walks_up_one_level() {
        let node = Xname::parse("x0c0s1b0n0").unwrap();
        let bmc = node.parent().unwrap();
        assert_eq!(bmc.as_str(), "x0c0s1b0");
        assert_eq!(bmc.kind(), XnameKind::NodeBmc);
        assert!(Xname::parse("x0").unwrap().parent().is_none());
    }

    #[test]
    fn ordinals_follow_segments() {
        let x: Xname = "x3000c0s7b0n1".parse().unwrap();
        assert_eq!(x.ordinals(), &[3000, 0, 7, 0, 1]);
    }
}
