//! Standard transceiver ID table (spec.md §6 "Standard transceiver
//! IDs"): a fixed table indexed by XID giving a 16-byte comm-param
//! template, with a seam for an external override source. XML parsing
//! of a `stdxcvr.xml`-equivalent file is explicitly out of scope
//! (spec.md §1), but "when both exist, XML wins" only makes sense if
//! the override path exists — [`TransceiverIdOverride`] is that seam.

/// A 16-byte comm-param template for one transceiver ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XcvrIdData {
    pub xid: i32,
    pub name: &'static str,
    pub comm_params: [u8; 16],
}

macro_rules! xid {
    ($xid:expr, $name:expr, $data:expr) => {
        XcvrIdData { xid: $xid, name: $name, comm_params: $data }
    };
}

/// Fixed table of standard transceiver templates, grounded on
/// `LtXcvrId.cpp`'s `xidDefs` table.
pub static STANDARD_TRANSCEIVERS: &[XcvrIdData] = &[
    xid!(1, "TP/XF-78", [0x25, 0xAC, 0x07, 0x04, 0x04, 0x0E, 0x0F, 0x00, 0x04, 0x2A, 0xA4, 0x00, 0x00, 0x00, 0x00, 0x00]),
    xid!(3, "TP/XF-1250", [0x05, 0xAC, 0x01, 0x04, 0x00, 0x00, 0x00, 0x00, 0x10, 0x60, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]),
    xid!(4, "TP/FT-10", [0x25, 0x2E, 0x08, 0x05, 0x0C, 0x0E, 0x0F, 0x00, 0x04, 0x00, 0xA4, 0x00, 0x00, 0x00, 0x00, 0x00]),
    xid!(5, "TP/RS485-39", [0x2D, 0x2E, 0x04, 0x05, 0x06, 0x0E, 0x10, 0x00, 0x04, 0x00, 0x4C, 0x00, 0x00, 0x00, 0x00, 0x00]),
    xid!(7, "RF-10", [0x3C, 0x2E, 0x4F, 0x13, 0x18, 0x22, 0x27, 0x00, 0x04, 0x60, 0x4C, 0x00, 0x00, 0x00, 0x00, 0x00]),
    xid!(9, "PL-10", [0x0D, 0x5E, 0x00, 0x10, 0x0C, 0x3B, 0x0F, 0x00, 0x08, 0x00, 0x0A, 0x00, 0x00, 0x00, 0x00, 0x00]),
    xid!(10, "TP/RS485-625", [0x0D, 0x2E, 0x08, 0x04, 0x02, 0x0E, 0x0F, 0x00, 0x04, 0x00, 0x0C, 0x00, 0x00, 0x00, 0x00, 0x00]),
    xid!(11, "TP/RS485-1250", [0x05, 0x2E, 0x01, 0x04, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]),
    xid!(12, "TP/RS485-78", [0x25, 0x2E, 0x06, 0x04, 0x04, 0x0E, 0x0F, 0x00, 0x04, 0x00, 0xA4, 0x00, 0x00, 0x00, 0x00, 0x00]),
    xid!(14, "PL-20A-LOW", [0x05, 0x5E, 0x00, 0x5A, 0xE6, 0xA9, 0x78, 0x00, 0x08, 0x0E, 0x01, 0x00, 0x12, 0x00, 0x01, 0x00]),
    xid!(15, "PL-20A", [0x05, 0x5E, 0x00, 0x5A, 0xE6, 0xA9, 0x78, 0x00, 0x08, 0x0E, 0x01, 0x00, 0x10, 0x00, 0x01, 0x00]),
    xid!(16, "PL-20C", [0x05, 0x5E, 0x00, 0x3F, 0xA6, 0x77, 0x67, 0x00, 0x08, 0x4A, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00]),
    xid!(17, "PL-20N", [0x05, 0x5E, 0x00, 0x3F, 0xA6, 0x77, 0x67, 0x00, 0x08, 0x0E, 0x01, 0x00, 0x10, 0x00, 0x00, 0x00]),
    xid!(18, "PL-30", [0x0D, 0x5E, 0x00, 0x4D, 0x30, 0xC4, 0x0F, 0x00, 0x0C, 0x00, 0x8A, 0x00, 0x00, 0x00, 0x00, 0x00]),
    xid!(19, "PL-20C-LOW", [0x05, 0x5E, 0x00, 0x3F, 0xA6, 0x77, 0x67, 0x00, 0x08, 0x4A, 0x00, 0x00, 0x12, 0x00, 0x00, 0x00]),
    xid!(20, "PL-20N-LOW", [0x05, 0x5E, 0x00, 0x3F, 0xA6, 0x77, 0x67, 0x00, 0x08, 0x0E, 0x01, 0x00, 0x12, 0x00, 0x00, 0x00]),
    xid!(21, "Mot-RF450", [0x3C, 0x2E, 0xFD, 0x17, 0x18, 0x22, 0x27, 0x00, 0x04, 0x60, 0x4C, 0x00, 0x00, 0x00, 0x00, 0x00]),
    xid!(22, "IR-10", [0x2D, 0x2E, 0x03, 0x05, 0x04, 0x0E, 0x0F, 0x00, 0x04, 0x00, 0x4C, 0x00, 0x00, 0x00, 0x00, 0x00]),
    xid!(23, "IR-20", [0x25, 0x2E, 0x05, 0x04, 0x02, 0x0E, 0x0F, 0x00, 0x04, 0x00, 0xA4, 0x00, 0x00, 0x00, 0x00, 0x00]),
    xid!(24, "FO-10", [0x05, 0x2E, 0x05, 0x04, 0x00, 0x00, 0x00, 0x00, 0x10, 0x80, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00]),
    xid!(25, "IP-10L", [0x05, 0xAC, 0x01, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x60, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]),
    xid!(30, "Custom", [0x05, 0xAC, 0x01, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]),
    xid!(154, "IP-852", [0x05, 0xAC, 0x01, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x60, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]),
    xid!(207, "PL-20A (alternate clock)", [0x04, 0x5F, 0x00, 0x3B, 0x96, 0x5A, 0x4A, 0x00, 0x08, 0x0E, 0x01, 0x00, 0x10, 0x00, 0x01, 0x00]),
    xid!(222, "PL-20A (alternate clock, NES)", [0x04, 0x5B, 0x00, 0x3B, 0x96, 0x5A, 0x4A, 0x00, 0x00, 0x0E, 0x01, 0x00, 0x12, 0x00, 0x01, 0x00]),
    xid!(223, "PL-20A (alternate clock, NES, AGC off, no atten)", [0x04, 0x5B, 0x00, 0x3B, 0x96, 0x5A, 0x4A, 0x00, 0x00, 0x1E, 0x01, 0x00, 0x12, 0x00, 0x01, 0x00]),
];

static DEFAULT_TRANSCEIVER: XcvrIdData =
    xid!(-1, "<not defined>", [0x05, 0xAC, 0x01, 0x04, 0x00, 0x00, 0x00, 0x00, 0x10, 0x60, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00]);

/// Supplies externally-provided overrides or extensions for a given
/// XID (spec.md §6: "An optional external XML file may override or
/// extend entries; when both exist, XML wins"). The XML source is
/// external to this crate; callers plug in whatever parses it.
pub trait TransceiverIdOverride: Send + Sync {
    fn lookup(&self, xid: i32) -> Option<XcvrIdData>;
}

/// Looks up the built-in table, falling back to `-1` ("not defined")
/// for an unknown XID. `overrides`, if given, is consulted first.
pub fn get_standard_transceiver_id(xid: i32, overrides: Option<&dyn TransceiverIdOverride>) -> XcvrIdData {
    if let Some(o) = overrides {
        if let Some(data) = o.lookup(xid) {
            return data;
        }
    }
    STANDARD_TRANSCEIVERS
        .iter()
        .find(|e| e.xid == xid)
        .copied()
        .unwrap_or(DEFAULT_TRANSCEIVER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn looks_up_known_xid() {
        let data = get_standard_transceiver_id(4, None);
        assert_eq!(data.name, "TP/FT-10");
        assert_eq!(data.comm_params[0], 0x25);
    }

    #[test]
    fn unknown_xid_falls_back_to_default() {
        let data = get_standard_transceiver_id(9999, None);
        assert_eq!(data.xid, -1);
    }

    struct FixedOverride(XcvrIdData);
    impl TransceiverIdOverride for FixedOverride {
        fn lookup(&self, xid: i32) -> Option<XcvrIdData> {
            (xid == self.0.xid).then_some(self.0)
        }
    }

    #[test]
    fn override_wins_over_builtin() {
        let custom = xid!(4, "Custom FT-10", [0xFF; 16]);
        let ov = FixedOverride(custom);
        let data = get_standard_transceiver_id(4, Some(&ov));
        assert_eq!(data.name, "Custom FT-10");
    }
}
