use std::fmt;
use std::ops::BitOr;

/// Flags attached to every result a producer delivers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Status(u8);

impl Status {
  pub const NO_FLAGS: Status = Status(0);
  /// The terminal result. Nothing follows it.
  pub const IS_LAST: Status = Status(1);
  /// The result must not be stored in the encoded memory cache.
  pub const DO_NOT_CACHE_ENCODED: Status = Status(1 << 1);
  /// A low-quality stand-in shown while the real result is produced.
  pub const IS_PLACEHOLDER: Status = Status(1 << 2);
  /// The result was produced from incomplete data.
  pub const IS_PARTIAL_RESULT: Status = Status(1 << 3);
  /// Downsampling has already been applied.
  pub const IS_RESIZING_DONE: Status = Status(1 << 4);

  #[inline]
  pub const fn bits(self) -> u8 {
    self.0
  }

  #[inline]
  pub const fn is_last(self) -> bool {
    self.0 & Self::IS_LAST.0 != 0
  }

  #[inline]
  pub const fn is_not_last(self) -> bool {
    !self.is_last()
  }

  /// Returns `true` if every flag in `flag` is set.
  #[inline]
  pub const fn has_flag(self, flag: Status) -> bool {
    self.0 & flag.0 == flag.0
  }

  /// Returns `true` if any flag in `flags` is set.
  #[inline]
  pub const fn has_any_flag(self, flags: Status) -> bool {
    self.0 & flags.0 != 0
  }

  #[inline]
  pub const fn turn_on(self, flag: Status) -> Status {
    Status(self.0 | flag.0)
  }

  #[inline]
  pub const fn turn_off(self, flag: Status) -> Status {
    Status(self.0 & !flag.0)
  }

  /// `IS_LAST` or no flags.
  #[inline]
  pub const fn simple_for_is_last(is_last: bool) -> Status {
    if is_last {
      Self::IS_LAST
    } else {
      Self::NO_FLAGS
    }
  }
}

impl BitOr for Status {
  type Output = Status;

  fn bitor(self, rhs: Status) -> Status {
    self.turn_on(rhs)
  }
}

impl fmt::Debug for Status {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    const NAMES: [(Status, &str); 5] = [
      (Status::IS_LAST, "IS_LAST"),
      (Status::DO_NOT_CACHE_ENCODED, "DO_NOT_CACHE_ENCODED"),
      (Status::IS_PLACEHOLDER, "IS_PLACEHOLDER"),
      (Status::IS_PARTIAL_RESULT, "IS_PARTIAL_RESULT"),
      (Status::IS_RESIZING_DONE, "IS_RESIZING_DONE"),
    ];
    let mut set = f.debug_set();
    for (flag, name) in NAMES {
      if self.has_flag(flag) {
        set.entry(&format_args!("{name}"));
      }
    }
    set.finish()
  }
}

/// How urgently a request should be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
  Low,
  #[default]
  Medium,
  High,
}

impl Priority {
  /// The more urgent of the two.
  pub fn higher(a: Priority, b: Priority) -> Priority {
    a.max(b)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn flag_helpers() {
    let status = Status::IS_LAST | Status::IS_PARTIAL_RESULT;
    assert!(status.is_last());
    assert!(status.has_flag(Status::IS_PARTIAL_RESULT));
    assert!(!status.has_flag(Status::IS_PARTIAL_RESULT | Status::IS_PLACEHOLDER));
    assert!(status.has_any_flag(Status::IS_PARTIAL_RESULT | Status::IS_PLACEHOLDER));

    let status = status.turn_off(Status::IS_LAST);
    assert!(status.is_not_last());
    assert_eq!(status.bits(), Status::IS_PARTIAL_RESULT.bits());
    assert_eq!(Status::simple_for_is_last(true), Status::IS_LAST);
    assert_eq!(Status::simple_for_is_last(false), Status::NO_FLAGS);
  }

  #[test]
  fn debug_lists_set_flags() {
    let status = Status::IS_LAST | Status::DO_NOT_CACHE_ENCODED;
    assert_eq!(format!("{status:?}"), "{IS_LAST, DO_NOT_CACHE_ENCODED}");
  }

  #[test]
  fn priority_ordering() {
    assert!(Priority::Low < Priority::Medium && Priority::Medium < Priority::High);
    assert_eq!(Priority::higher(Priority::Low, Priority::High), Priority::High);
    assert_eq!(Priority::higher(Priority::Medium, Priority::Low), Priority::Medium);
  }
}
