//! Luhn checksum validation for order numbers

use thiserror::Error;

/// Reasons an order number is rejected
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumError {
    /// Empty input
    #[error("order number is empty")]
    Empty,

    /// Character outside `0-9`
    #[error("non-digit character {found:?} at position {position}")]
    NonDigit {
        /// Byte offset of the offending character
        position: usize,
        /// The character itself
        found: char,
    },

    /// Well-formed digits, wrong check digit
    #[error("checksum mismatch")]
    Mismatch,
}

/// Run the Luhn algorithm over `number`.
///
/// Returns `Ok(false)` for a well-formed number with a wrong check digit and
/// an error when the input is empty or contains anything but ASCII digits.
pub fn luhn_valid(number: &str) -> Result<bool, ChecksumError> {
    if number.is_empty() {
        return Err(ChecksumError::Empty);
    }

    let mut sum = 0u32;
    for (index, (position, ch)) in number.char_indices().rev().enumerate() {
        let digit = ch
            .to_digit(10)
            .ok_or(ChecksumError::NonDigit { position, found: ch })?;

        sum += if index % 2 == 1 {
            let doubled = digit * 2;
            if doubled > 9 {
                doubled - 9
            } else {
                doubled
            }
        } else {
            digit
        };
    }

    Ok(sum % 10 == 0)
}

/// Validate `number`, folding a failed checksum into [`ChecksumError::Mismatch`]
pub fn verify(number: &str) -> Result<(), ChecksumError> {
    if luhn_valid(number)? {
        Ok(())
    } else {
        Err(ChecksumError::Mismatch)
    }
}
