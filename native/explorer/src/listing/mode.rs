/// rwx triads indexed by one octal digit
const TRIADS: [&str; 8] = ["---", "--x", "-w-", "-wx", "r--", "r-x", "rw-", "rwx"];

/// Returns the type letter for the file-type bits of `mode`
fn type_char(mode: u32) -> char {
    let low = (mode >> 12) & 0o7;
    let high = (mode >> 15) & 0o7;
    if high == 0 {
        match low {
            1 => 'p',
            2 => 'c',
            4 => 'd',
            6 => 'b',
            _ => '?',
        }
    } else {
        match low {
            0 => '-',
            2 => 'l',
            4 => 's',
            _ => '?',
        }
    }
}

/// Converts a numeric `st_mode` into a `drwxr-xr-x` style string
pub fn mode_to_permissions(mode: u32) -> String {
    let mut chars: Vec<char> = Vec::with_capacity(10);
    chars.push(type_char(mode));
    for shift in [6, 3, 0] {
        chars.extend(TRIADS[((mode >> shift) & 0o7) as usize].chars());
    }

    let special = (mode >> 9) & 0o7;
    for (bit, slot, set) in [(0o4, 3, 's'), (0o2, 6, 's'), (0o1, 9, 't')] {
        if special & bit != 0 {
            chars[slot] = if chars[slot] == 'x' { set } else { set.to_ascii_uppercase() };
        }
    }
    chars.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_modes() {
        assert_eq!(mode_to_permissions(0o040771), "drwxrwx--x");
        assert_eq!(mode_to_permissions(0o100644), "-rw-r--r--");
        assert_eq!(mode_to_permissions(0o120777), "lrwxrwxrwx");
        assert_eq!(mode_to_permissions(0o140755), "srwxr-xr-x");
        assert_eq!(mode_to_permissions(0o020666), "crw-rw-rw-");
        assert_eq!(mode_to_permissions(0o060600), "brw-------");
        assert_eq!(mode_to_permissions(0o010600), "prw-------");
    }

    #[test]
    fn special_bits_overlay_exec_slots() {
        assert_eq!(mode_to_permissions(0o104755), "-rwsr-xr-x");
        assert_eq!(mode_to_permissions(0o102745), "-rwxr-Sr-x");
        assert_eq!(mode_to_permissions(0o041777), "drwxrwxrwt");
        assert_eq!(mode_to_permissions(0o041776), "drwxrwxrwT");
    }

    #[test]
    fn unknown_type_bits() {
        assert_eq!(mode_to_permissions(0o000644), "?rw-r--r--");
        assert_eq!(mode_to_permissions(0o160644).chars().next(), Some('?'));
    }
}
