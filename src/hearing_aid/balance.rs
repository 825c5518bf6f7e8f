//! Conversion between the aggregate amplification/balance pair shown to the
//! user and the per-ear amplification values stored on the accessory.
//!
//! The split keeps the `0.5` offset in both branches exactly as the accessory
//! app applies it. A balance of `-1.0` on an amplification of `0.4` therefore
//! yields a left value of `1.6`, not `0.8`. Whether that is calibration or a
//! defect in the original control mapping is unknown, so it is reproduced
//! as-is and nothing here clamps the per-ear result.

/// Splits an aggregate amplification and balance into `(left, right)`.
pub fn split_amplification(amplification: f32, balance: f32) -> (f32, f32) {
   let a = amplification;
   if balance < 0.0 {
      (a + (0.5 - balance) * a * 2.0, a)
   } else if balance > 0.0 {
      (a, a + (balance - 0.5) * a * 2.0)
   } else {
      (a, a)
   }
}

/// Derives `(net_amplification, balance)` from per-ear amplification.
///
/// Both results are clamped to `[-1, 1]`.
pub fn join_amplification(left: f32, right: f32) -> (f32, f32) {
   let net = ((left + right) / 2.0).clamp(-1.0, 1.0);
   let balance = (right - left).clamp(-1.0, 1.0);
   (net, balance)
}

#[cfg(test)]
mod tests {
   use super::*;

   fn approx(a: f32, b: f32) -> bool {
      (a - b).abs() < 1e-5
   }

   #[test]
   fn zero_balance_is_identity() {
      for amp in [-1.0, -0.3, 0.0, 0.25, 1.0, 7.5] {
         assert_eq!(split_amplification(amp, 0.0), (amp, amp));
      }
   }

   #[test]
   fn negative_balance_boosts_left_with_offset() {
      let (left, right) = split_amplification(0.4, -1.0);
      assert!(approx(left, 1.6), "left was {left}");
      assert!(approx(right, 0.4));
   }

   #[test]
   fn positive_balance_applies_offset_to_right() {
      let (left, right) = split_amplification(0.4, 1.0);
      assert!(approx(left, 0.4));
      assert!(approx(right, 0.8), "right was {right}");

      // Small positive balances pull the right ear below the aggregate.
      let (_, right) = split_amplification(0.4, 0.1);
      assert!(approx(right, 0.08), "right was {right}");
   }

   #[test]
   fn negative_amplification_is_not_special_cased() {
      let (left, right) = split_amplification(-0.5, -0.5);
      assert!(approx(left, -1.5), "left was {left}");
      assert!(approx(right, -0.5));

      let (left, right) = split_amplification(-0.5, 0.5);
      assert!(approx(left, -0.5));
      assert!(approx(right, -0.5));
   }

   #[test]
   fn join_clamps_both_values() {
      assert_eq!(join_amplification(3.0, 5.0), (1.0, 1.0));
      assert_eq!(join_amplification(5.0, -3.0), (1.0, -1.0));
      assert_eq!(join_amplification(-4.0, -2.0), (-1.0, 1.0));

      let (net, balance) = join_amplification(0.2, 0.4);
      assert!(approx(net, 0.3));
      assert!(approx(balance, 0.2));
   }
}
