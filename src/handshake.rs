//! Challenge / response validation performed before a connection is admitted to regular
//!  traffic: the server sends a random 64-bit challenge, the client must return
//!  [scramble] of it, and the server compares against its own precomputed result.
//!
//! The transform is deliberately cheap and reversible-by-anyone-who-reads-the-source. It
//!  keeps trivially dumb port scanners and protocol-oblivious clients out; it does not
//!  authenticate anybody.

/// XORed into the challenge before the nibble swap. Part of the wire contract: both ends
///  must use the same pair of constants or no handshake will ever validate.
pub const SCRAMBLE_XOR_IN: u64 = 0x9E37_79B9_7F4A_7C15;

/// XORed into the result after the nibble swap. Part of the wire contract.
pub const SCRAMBLE_XOR_OUT: u64 = 0x6A09_E667_F3BC_C909;

/// The pure, deterministic mixing function both ends apply to the challenge: XOR with
///  [SCRAMBLE_XOR_IN], swap the high and low nibble of every byte, XOR with
///  [SCRAMBLE_XOR_OUT].
pub fn scramble(input: u64) -> u64 {
    let mixed = input ^ SCRAMBLE_XOR_IN;
    let swapped = ((mixed & 0xF0F0_F0F0_F0F0_F0F0) >> 4) | ((mixed & 0x0F0F_0F0F_0F0F_0F0F) << 4);
    swapped ^ SCRAMBLE_XOR_OUT
}

/// A fresh challenge for one handshake attempt. Unpredictability is a nice-to-have here,
///  not a security property.
pub fn new_challenge() -> u64 {
    rand::random()
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    /// Pinned expected values: these are part of the wire contract, and changing the
    ///  constants or the transform breaks interoperability with every deployed peer.
    #[rstest]
    #[case::zero(0, 0x837A_71FC_0418_0E58)]
    #[case::one(1, 0x837A_71FC_0418_0E48)]
    #[case::pattern(0x0123_4567_89AB_CDEF, 0x9348_258A_9CA2_D2A6)]
    #[case::all_ones(u64::MAX, 0x7C85_8E03_FBE7_F1A7)]
    fn test_scramble_known_values(#[case] input: u64, #[case] expected: u64) {
        assert_eq!(scramble(input), expected);
    }

    #[rstest]
    #[case(0)]
    #[case(42)]
    #[case(u64::MAX / 3)]
    fn test_scramble_is_deterministic(#[case] input: u64) {
        assert_eq!(scramble(input), scramble(input));
    }

    #[test]
    fn test_scramble_distinguishes_inputs() {
        // not a collision-resistance claim, just a sanity check that the transform is
        // actually input-dependent
        assert_ne!(scramble(1), scramble(2));
        assert_ne!(scramble(0), scramble(u64::MAX));
    }

    #[test]
    fn test_mismatched_constants_never_validate() {
        let challenge = 0x1122_3344_5566_7788;
        let with_other_constants = {
            let mixed = challenge ^ 0x0BAD_0BAD_0BAD_0BAD;
            let swapped =
                ((mixed & 0xF0F0_F0F0_F0F0_F0F0) >> 4) | ((mixed & 0x0F0F_0F0F_0F0F_0F0F) << 4);
            swapped ^ 0x0DDC_0FFE_EBAD_F00D
        };
        assert_ne!(scramble(challenge), with_other_constants);
    }
}
