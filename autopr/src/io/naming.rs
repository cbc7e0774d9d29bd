//! Clock- and randomness-backed name parts for branches and records.

use chrono::Local;
use rand::Rng;
use rand::distributions::Uniform;

/// Local timestamp used in branch and record names, e.g. `20260101-093000`.
pub fn branch_stamp() -> String {
    Local::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Four random lowercase letters.
pub fn branch_token() -> String {
    let letters = Uniform::new_inclusive(b'a', b'z');
    rand::thread_rng()
        .sample_iter(letters)
        .take(4)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_has_expected_shape() {
        let stamp = branch_stamp();
        assert_eq!(stamp.len(), 15);
        assert_eq!(&stamp[8..9], "-");
    }

    #[test]
    fn token_is_four_lowercase_letters() {
        for _ in 0..20 {
            let token = branch_token();
            assert_eq!(token.len(), 4);
            assert!(token.chars().all(|c| c.is_ascii_lowercase()));
        }
    }
}
