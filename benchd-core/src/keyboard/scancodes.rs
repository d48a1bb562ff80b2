//! PS/2 set-2 scan codes for stable key identifiers.
//!
//! Identifiers follow the W3C `KeyboardEvent.code` vocabulary. Extended keys
//! carry the `0xE0` prefix; everything else has prefix 0. Wire form is
//! `<hex(prefix)>:<hex(code)>`, two digits each.

use crate::error::{BenchError, Result};

const EXT: u8 = 0xE0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScanCode {
    /// `0` means no prefix byte.
    pub prefix: u8,
    pub code: u8,
}

impl ScanCode {
    const fn plain(code: u8) -> Self {
        Self { prefix: 0, code }
    }

    const fn extended(code: u8) -> Self {
        Self { prefix: EXT, code }
    }

    /// Wire form, e.g. `00:1c` or `e0:75`.
    pub fn wire(&self) -> String {
        format!("{:02x}:{:02x}", self.prefix, self.code)
    }

    pub fn parse_wire(s: &str) -> Result<Self> {
        let (prefix, code) = s
            .split_once(':')
            .ok_or_else(|| BenchError::Protocol(format!("bad scan code: {s}")))?;
        let parse = |part: &str| {
            if part.len() != 2 {
                return Err(BenchError::Protocol(format!("bad scan code: {s}")));
            }
            u8::from_str_radix(part, 16)
                .map_err(|_| BenchError::Protocol(format!("bad scan code: {s}")))
        };
        Ok(Self {
            prefix: parse(prefix)?,
            code: parse(code)?,
        })
    }
}

/// The eight modifier identifiers tracked by the held-set.
pub const MODIFIERS: [&str; 8] = [
    "ShiftLeft",
    "ShiftRight",
    "ControlLeft",
    "ControlRight",
    "AltLeft",
    "AltRight",
    "MetaLeft",
    "MetaRight",
];

pub fn is_modifier(identifier: &str) -> bool {
    MODIFIERS.contains(&identifier)
}

/// Look up the set-2 make code for a key identifier.
pub fn lookup(identifier: &str) -> Option<ScanCode> {
    let sc = match identifier {
        // Letters
        "KeyA" => ScanCode::plain(0x1C),
        "KeyB" => ScanCode::plain(0x32),
        "KeyC" => ScanCode::plain(0x21),
        "KeyD" => ScanCode::plain(0x23),
        "KeyE" => ScanCode::plain(0x24),
        "KeyF" => ScanCode::plain(0x2B),
        "KeyG" => ScanCode::plain(0x34),
        "KeyH" => ScanCode::plain(0x33),
        "KeyI" => ScanCode::plain(0x43),
        "KeyJ" => ScanCode::plain(0x3B),
        "KeyK" => ScanCode::plain(0x42),
        "KeyL" => ScanCode::plain(0x4B),
        "KeyM" => ScanCode::plain(0x3A),
        "KeyN" => ScanCode::plain(0x31),
        "KeyO" => ScanCode::plain(0x44),
        "KeyP" => ScanCode::plain(0x4D),
        "KeyQ" => ScanCode::plain(0x15),
        "KeyR" => ScanCode::plain(0x2D),
        "KeyS" => ScanCode::plain(0x1B),
        "KeyT" => ScanCode::plain(0x2C),
        "KeyU" => ScanCode::plain(0x3C),
        "KeyV" => ScanCode::plain(0x2A),
        "KeyW" => ScanCode::plain(0x1D),
        "KeyX" => ScanCode::plain(0x22),
        "KeyY" => ScanCode::plain(0x35),
        "KeyZ" => ScanCode::plain(0x1A),

        // Digit row
        "Digit1" => ScanCode::plain(0x16),
        "Digit2" => ScanCode::plain(0x1E),
        "Digit3" => ScanCode::plain(0x26),
        "Digit4" => ScanCode::plain(0x25),
        "Digit5" => ScanCode::plain(0x2E),
        "Digit6" => ScanCode::plain(0x36),
        "Digit7" => ScanCode::plain(0x3D),
        "Digit8" => ScanCode::plain(0x3E),
        "Digit9" => ScanCode::plain(0x46),
        "Digit0" => ScanCode::plain(0x45),

        // Modifiers
        "ShiftLeft" => ScanCode::plain(0x12),
        "ShiftRight" => ScanCode::plain(0x59),
        "ControlLeft" => ScanCode::plain(0x14),
        "ControlRight" => ScanCode::extended(0x14),
        "AltLeft" => ScanCode::plain(0x11),
        "AltRight" => ScanCode::extended(0x11),
        "MetaLeft" => ScanCode::extended(0x1F),
        "MetaRight" => ScanCode::extended(0x27),

        // Editing and whitespace
        "Enter" => ScanCode::plain(0x5A),
        "Escape" => ScanCode::plain(0x76),
        "Backspace" => ScanCode::plain(0x66),
        "Tab" => ScanCode::plain(0x0D),
        "Space" => ScanCode::plain(0x29),
        "CapsLock" => ScanCode::plain(0x58),

        // Punctuation
        "Minus" => ScanCode::plain(0x4E),
        "Equal" => ScanCode::plain(0x55),
        "BracketLeft" => ScanCode::plain(0x54),
        "BracketRight" => ScanCode::plain(0x5B),
        "Backslash" => ScanCode::plain(0x5D),
        "Semicolon" => ScanCode::plain(0x4C),
        "Quote" => ScanCode::plain(0x52),
        "Backquote" => ScanCode::plain(0x0E),
        "Comma" => ScanCode::plain(0x41),
        "Period" => ScanCode::plain(0x49),
        "Slash" => ScanCode::plain(0x4A),

        // Navigation (extended)
        "Insert" => ScanCode::extended(0x70),
        "Delete" => ScanCode::extended(0x71),
        "Home" => ScanCode::extended(0x6C),
        "End" => ScanCode::extended(0x69),
        "PageUp" => ScanCode::extended(0x7D),
        "PageDown" => ScanCode::extended(0x7A),
        "ArrowUp" => ScanCode::extended(0x75),
        "ArrowDown" => ScanCode::extended(0x72),
        "ArrowLeft" => ScanCode::extended(0x6B),
        "ArrowRight" => ScanCode::extended(0x74),

        // Function row
        "F1" => ScanCode::plain(0x05),
        "F2" => ScanCode::plain(0x06),
        "F3" => ScanCode::plain(0x04),
        "F4" => ScanCode::plain(0x0C),
        "F5" => ScanCode::plain(0x03),
        "F6" => ScanCode::plain(0x0B),
        "F7" => ScanCode::plain(0x83),
        "F8" => ScanCode::plain(0x0A),
        "F9" => ScanCode::plain(0x01),
        "F10" => ScanCode::plain(0x09),
        "F11" => ScanCode::plain(0x78),
        "F12" => ScanCode::plain(0x07),

        // Locks
        "NumLock" => ScanCode::plain(0x77),
        "ScrollLock" => ScanCode::plain(0x7E),

        // Numpad
        "Numpad0" => ScanCode::plain(0x70),
        "Numpad1" => ScanCode::plain(0x69),
        "Numpad2" => ScanCode::plain(0x72),
        "Numpad3" => ScanCode::plain(0x7A),
        "Numpad4" => ScanCode::plain(0x6B),
        "Numpad5" => ScanCode::plain(0x73),
        "Numpad6" => ScanCode::plain(0x74),
        "Numpad7" => ScanCode::plain(0x6C),
        "Numpad8" => ScanCode::plain(0x75),
        "Numpad9" => ScanCode::plain(0x7D),
        "NumpadAdd" => ScanCode::plain(0x79),
        "NumpadSubtract" => ScanCode::plain(0x7B),
        "NumpadMultiply" => ScanCode::plain(0x7C),
        "NumpadDivide" => ScanCode::extended(0x4A),
        "NumpadEnter" => ScanCode::extended(0x5A),
        "NumpadDecimal" => ScanCode::plain(0x71),

        _ => return None,
    };
    Some(sc)
}
