//! Size-class bucketing over eight fixed bounds.

use crate::config::{NUM_CLASSES, SIZE_CLASS_BOUNDS};

/// The smallest class whose bound is `>= size`; `NUM_CLASSES - 1` for any
/// `size` larger than the last bound.
#[inline]
pub fn class_of(size: usize) -> usize {
    for (index, bound) in SIZE_CLASS_BOUNDS.iter().enumerate() {
        if size <= *bound {
            return index;
        }
    }
    NUM_CLASSES - 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_boundaries() {
        assert_eq!(class_of(1), 0);
        assert_eq!(class_of(32), 0);
        assert_eq!(class_of(33), 1);
        assert_eq!(class_of(64), 1);
        assert_eq!(class_of(65), 2);
        assert_eq!(class_of(2048), NUM_CLASSES - 2);
        assert_eq!(class_of(2049), NUM_CLASSES - 1);
        assert_eq!(class_of(1_000_000), NUM_CLASSES - 1);
    }
}
