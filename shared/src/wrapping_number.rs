/// Returns whether or not a wrapping sequence number is greater than another
/// sequence_greater_than(2,1) will return true
/// sequence_greater_than(1,2) will return false
/// sequence_greater_than(1,1) will return false
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    wrapping_diff(s2, s1) > 0
}

/// Returns whether or not a wrapping sequence number is less than another
pub fn sequence_less_than(s1: u32, s2: u32) -> bool {
    sequence_greater_than(s2, s1)
}

/// Signed distance from `a` forward to `b`, across the wrap point.
///
/// # Examples
/// ```
/// # use actornet_shared::wrapping_diff;
/// assert_eq!(wrapping_diff(1, 2), 1);
/// assert_eq!(wrapping_diff(2, 1), -1);
/// assert_eq!(wrapping_diff(u32::MAX, 0), 1);
/// assert_eq!(wrapping_diff(0, u32::MAX), -1);
/// ```
pub fn wrapping_diff(a: u32, b: u32) -> i32 {
    b.wrapping_sub(a) as i32
}
