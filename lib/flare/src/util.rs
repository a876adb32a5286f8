use std::fmt::Write;

#[macro_export]
macro_rules! choose {
    ($cond: expr => $true_val: expr, $false_val: expr) => {{
        if $cond {
            $true_val
        } else {
            $false_val
        }
    }};
}

/// Renders the supplied bytes as a contiguous lowercase hex string.
pub fn hex_str(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);

    for byte in bytes {
        write!(out, "{:02x}", byte).expect("Error writing hex digit");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_str() {
        assert_eq!(hex_str(&[0x00, 0x1f, 0xab, 0xff]), "001fabff");
        assert_eq!(hex_str(&[]), "");
    }

    #[test]
    fn test_choose() {
        assert_eq!(choose!(1 + 1 == 2 => "yes", "no"), "yes");
        assert_eq!(choose!(1 + 1 == 3 => "yes", "no"), "no");
    }
}
