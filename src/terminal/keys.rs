//! Key encoding: `(KeyType, modifier_bits)` → the escape sequence sent to the
//! multiplexer, per the standard `shift=1, alt=2, ctrl=4` modifier bitset.

pub const MOD_SHIFT: u8 = 1;
pub const MOD_ALT: u8 = 2;
pub const MOD_CTRL: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Enter,
    Tab,
    Backspace,
    Escape,
    Delete,
    Insert,
    Up,
    Down,
    Right,
    Left,
    Home,
    End,
    PageUp,
    PageDown,
    F1,
    F2,
    F3,
    F4,
    F5,
    F6,
    F7,
    F8,
    F9,
    F10,
    F11,
    F12,
    CtrlC,
    CtrlD,
    CtrlZ,
}

/// How a base sequence responds to modifiers.
enum Shape {
    /// A single byte or fixed control code; modifiers never change it.
    Fixed(&'static [u8]),
    /// `ESC[<final>` with an implicit params value of `1` (arrows, Home/End).
    CsiLetter(u8),
    /// `ESC[<n>~` (Delete/Insert/PgUp/PgDn/F5-F12).
    CsiTilde(u8),
    /// `ESC O <final>` (F1-F4); modified forms switch to CSI per xterm.
    Ss3Letter(u8),
}

fn shape(key: KeyType) -> Shape {
    match key {
        KeyType::Enter => Shape::Fixed(b"\r"),
        KeyType::Tab => Shape::Fixed(b"\t"),
        KeyType::Backspace => Shape::Fixed(&[0x7F]),
        KeyType::Escape => Shape::Fixed(&[0x1B]),
        KeyType::CtrlC => Shape::Fixed(&[0x03]),
        KeyType::CtrlD => Shape::Fixed(&[0x04]),
        KeyType::CtrlZ => Shape::Fixed(&[0x1A]),
        KeyType::Delete => Shape::CsiTilde(3),
        KeyType::Insert => Shape::CsiTilde(2),
        KeyType::PageUp => Shape::CsiTilde(5),
        KeyType::PageDown => Shape::CsiTilde(6),
        KeyType::Up => Shape::CsiLetter(b'A'),
        KeyType::Down => Shape::CsiLetter(b'B'),
        KeyType::Right => Shape::CsiLetter(b'C'),
        KeyType::Left => Shape::CsiLetter(b'D'),
        KeyType::Home => Shape::CsiLetter(b'H'),
        KeyType::End => Shape::CsiLetter(b'F'),
        KeyType::F1 => Shape::Ss3Letter(b'P'),
        KeyType::F2 => Shape::Ss3Letter(b'Q'),
        KeyType::F3 => Shape::Ss3Letter(b'R'),
        KeyType::F4 => Shape::Ss3Letter(b'S'),
        KeyType::F5 => Shape::CsiTilde(15),
        KeyType::F6 => Shape::CsiTilde(17),
        KeyType::F7 => Shape::CsiTilde(18),
        KeyType::F8 => Shape::CsiTilde(19),
        KeyType::F9 => Shape::CsiTilde(20),
        KeyType::F10 => Shape::CsiTilde(21),
        KeyType::F11 => Shape::CsiTilde(23),
        KeyType::F12 => Shape::CsiTilde(24),
    }
}

/// Encode one key press with the given modifier bitset.
pub fn encode(key: KeyType, modifiers: u8) -> Vec<u8> {
    if key == KeyType::Tab && modifiers & MOD_SHIFT != 0 {
        return b"\x1b[Z".to_vec();
    }

    match shape(key) {
        Shape::Fixed(bytes) => bytes.to_vec(),
        Shape::CsiLetter(final_byte) => {
            if modifiers == 0 {
                vec![0x1B, b'[', final_byte]
            } else {
                format!("\x1b[1;{}{}", 1 + modifiers as u32, final_byte as char).into_bytes()
            }
        }
        Shape::CsiTilde(n) => {
            if modifiers == 0 {
                format!("\x1b[{n}~").into_bytes()
            } else {
                format!("\x1b[{n};{}~", 1 + modifiers as u32).into_bytes()
            }
        }
        Shape::Ss3Letter(final_byte) => {
            if modifiers == 0 {
                vec![0x1B, b'O', final_byte]
            } else {
                format!("\x1b[1;{}{}", 1 + modifiers as u32, final_byte as char).into_bytes()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_keys_match_the_base_table() {
        assert_eq!(encode(KeyType::Enter, 0), b"\r");
        assert_eq!(encode(KeyType::Tab, 0), b"\t");
        assert_eq!(encode(KeyType::Backspace, 0), &[0x7F]);
        assert_eq!(encode(KeyType::Escape, 0), &[0x1B]);
        assert_eq!(encode(KeyType::Delete, 0), b"\x1b[3~");
        assert_eq!(encode(KeyType::Insert, 0), b"\x1b[2~");
        assert_eq!(encode(KeyType::Up, 0), b"\x1b[A");
        assert_eq!(encode(KeyType::Home, 0), b"\x1b[H");
        assert_eq!(encode(KeyType::End, 0), b"\x1b[F");
        assert_eq!(encode(KeyType::PageUp, 0), b"\x1b[5~");
        assert_eq!(encode(KeyType::PageDown, 0), b"\x1b[6~");
        assert_eq!(encode(KeyType::F1, 0), b"\x1bOP");
        assert_eq!(encode(KeyType::F5, 0), b"\x1b[15~");
        assert_eq!(encode(KeyType::F12, 0), b"\x1b[24~");
    }

    #[test]
    fn shift_tab_uses_the_explicit_sequence() {
        assert_eq!(encode(KeyType::Tab, MOD_SHIFT), b"\x1b[Z");
    }

    #[test]
    fn ctrl_keys_ignore_extra_ctrl_modifier() {
        assert_eq!(encode(KeyType::CtrlC, MOD_CTRL), &[0x03]);
        assert_eq!(encode(KeyType::CtrlD, 0), &[0x04]);
        assert_eq!(encode(KeyType::CtrlZ, 0), &[0x1A]);
    }

    #[test]
    fn modifiers_rewrite_extended_sequences() {
        // shift (1) -> mod_param 2
        assert_eq!(encode(KeyType::Up, MOD_SHIFT), b"\x1b[1;2A");
        // ctrl (4) -> mod_param 5
        assert_eq!(encode(KeyType::Delete, MOD_CTRL), b"\x1b[3;5~");
        // alt+ctrl (6) -> mod_param 7
        assert_eq!(encode(KeyType::F1, MOD_ALT | MOD_CTRL), b"\x1b[1;7P");
    }

    #[test]
    fn single_byte_sequences_are_unaffected_by_modifiers() {
        assert_eq!(encode(KeyType::Enter, MOD_SHIFT | MOD_ALT | MOD_CTRL), b"\r");
        assert_eq!(encode(KeyType::Backspace, MOD_CTRL), &[0x7F]);
    }
}
