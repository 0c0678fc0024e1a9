//! See [`Seq`].

use core::{
    cmp::Ordering,
    ops::{Add, AddAssign, Sub, SubAssign},
};

/// Sequence number of a packet or message sent over a connection.
///
/// Stored as a [`u16`], which wraps around quickly under real traffic, so all
/// comparisons go through the custom [`Ord`] impl which respects wraparound:
/// a value up to `2^15` ahead of another is treated as newer, anything else
/// as older. Think of sequence numbers as positions on a circle rather than a
/// line:
///
/// ```text
///     65534  65535    0      1      2
/// ... --|------|------|------|------|-- ...
/// ```
///
/// No guarantees are made when two compared values are a real distance of
/// `2^15` or more apart; by then the connection has bigger problems.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Seq(pub u16);

impl Seq {
    /// Sequence number with value [`u16::MAX`].
    pub const MAX: Self = Self(u16::MAX);

    /// Signed shortest distance from `self` to `rhs`, taking wraparound into
    /// account.
    ///
    /// Positive means `rhs` is newer than `self`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use gale_proto::seq::Seq;
    /// assert_eq!(Seq(0).dist_to(Seq(0)), 0);
    /// assert_eq!(Seq(3).dist_to(Seq(5)), 2);
    /// assert_eq!(Seq(5).dist_to(Seq(3)), -2);
    /// assert_eq!(Seq::MAX.dist_to(Seq(0)), 1);
    /// assert_eq!(Seq(0).dist_to(Seq::MAX), -1);
    /// ```
    #[must_use]
    pub const fn dist_to(self, rhs: Self) -> i16 {
        #[expect(clippy::cast_possible_wrap, reason = "wrapping is the point")]
        (rhs.0.wrapping_sub(self.0) as i16)
    }
}

impl Ord for Seq {
    /// Compares respecting wraparound, so `Seq(0) > Seq::MAX` while
    /// `Seq(0) < Seq(1)` as expected.
    fn cmp(&self, other: &Self) -> Ordering {
        other.dist_to(*self).cmp(&0)
    }
}

impl PartialOrd for Seq {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add<u16> for Seq {
    type Output = Self;

    fn add(self, rhs: u16) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u16> for Seq {
    fn add_assign(&mut self, rhs: u16) {
        *self = *self + rhs;
    }
}

impl Sub<u16> for Seq {
    type Output = Self;

    fn sub(self, rhs: u16) -> Self::Output {
        Self(self.0.wrapping_sub(rhs))
    }
}

impl SubAssign<u16> for Seq {
    fn sub_assign(&mut self, rhs: u16) {
        *self = *self - rhs;
    }
}
