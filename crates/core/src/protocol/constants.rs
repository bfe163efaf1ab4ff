// ==============================================================================
// crates/core/src/protocol/constants.rs - IPMSG Command Words and Separators
// ==============================================================================

//! Protocol constants for the IPMSG/FeiQ wire format.
//!
//! A command word is a 32-bit integer whose low byte selects the *mode*
//! (presence, message, file data) while the remaining bits are independent
//! *option* flags. Mode and options are orthogonal: any option may be OR-ed
//! onto any mode and is tested independently of it.

/// Literal version tag carried in the first wire field.
pub const PROTOCOL_VERSION: &str = "1";

/// Default UDP control port. The bulk-transfer TCP listener shares it.
pub const DEFAULT_PORT: u16 = 2425;

/// Low byte of the command word selects the mode.
pub const MODE_MASK: u32 = 0x0000_00ff;

/// Separator between descriptors in a file-attach list (ASCII BEL).
pub const FILELIST_SEPARATOR: u8 = 0x07;

/// Command modes (low byte of the command word).
pub mod mode {
    /// Broadcast presence on entry.
    pub const BR_ENTRY: u32 = 0x0000_0001;
    /// Broadcast departure.
    pub const BR_EXIT: u32 = 0x0000_0002;
    /// Targeted reply to an entry broadcast.
    pub const ANSENTRY: u32 = 0x0000_0003;
    /// Text message.
    pub const SENDMSG: u32 = 0x0000_0020;
    /// Delivery receipt for a SENDMSG carrying the check option.
    pub const RECVMSG: u32 = 0x0000_0021;
    /// Request file bytes for an announced attachment.
    pub const GETFILEDATA: u32 = 0x0000_0060;
}

/// Option flags (orthogonal to the mode).
pub mod opt {
    /// Sender asks for a RECVMSG receipt.
    pub const SENDCHECK: u32 = 0x0000_0100;
    /// Encrypted payload. Unimplemented here, kept for wire compatibility.
    pub const SECRET: u32 = 0x0000_0200;
    /// Message was broadcast rather than unicast.
    pub const BROADCAST: u32 = 0x0000_0400;
    /// Multicast delivery. Out of scope, never set.
    pub const MULTICAST: u32 = 0x0000_0800;
    /// Receiver should not pop a window for this message.
    pub const NOPOPUP: u32 = 0x0000_1000;
    /// Message carries a file-attach descriptor list in its extra field.
    pub const FILEATTACH: u32 = 0x0020_0000;
    /// Payload text is UTF-8.
    pub const UTF8: u32 = 0x0080_0000;
}

/// File types carried in an attach descriptor.
pub mod file_type {
    pub const REGULAR: u32 = 0x0000_0001;
    pub const DIR: u32 = 0x0000_0002;
}

/// Extract the mode from a command word.
pub fn mode_of(command: u32) -> u32 {
    command & MODE_MASK
}

/// Test a single option flag, independent of the mode.
pub fn has_opt(command: u32, opt: u32) -> bool {
    command & opt == opt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_and_options_are_orthogonal() {
        let cmd = mode::SENDMSG | opt::SENDCHECK | opt::FILEATTACH;
        assert_eq!(mode_of(cmd), mode::SENDMSG);
        assert!(has_opt(cmd, opt::SENDCHECK));
        assert!(has_opt(cmd, opt::FILEATTACH));
        assert!(!has_opt(cmd, opt::SECRET));

        let cmd = mode::BR_ENTRY | opt::UTF8;
        assert_eq!(mode_of(cmd), mode::BR_ENTRY);
        assert!(has_opt(cmd, opt::UTF8));
    }
}
