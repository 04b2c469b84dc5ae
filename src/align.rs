use std::num::Wrapping;

pub(crate) fn align(ix: usize, alignment: usize) -> usize {
    debug_assert!(
        alignment.is_power_of_two(),
        "{} is not power of 2, cannot be used as alignment",
        alignment
    );
    let mask = Wrapping(alignment) - Wrapping(1);
    let old_size = Wrapping(ix);
    let new_size = old_size + ((-old_size) & mask);
    new_size.0
}

pub(crate) fn pad_vec(vec: &mut Vec<u8>, alignment: usize) {
    vec.resize(align(vec.len(), alignment), 0);
}

#[cfg(test)]
mod tests {
    use super::{align, pad_vec};

    #[test]
    fn alignment() {
        assert_eq!(align(23usize, 4usize), 24usize);
        assert_eq!(align(32usize, 4usize), 32usize);
        assert_eq!(align(31usize, 1usize), 31usize);
        assert_eq!(align(0usize, 8usize), 0usize);
        assert_eq!(align(1usize, 8usize), 8usize);
    }

    #[test]
    fn pad_with_zeroes() {
        let mut v = vec![1u8, 2, 3];
        pad_vec(&mut v, 8);
        assert_eq!(v, vec![1, 2, 3, 0, 0, 0, 0, 0]);
    }
}
