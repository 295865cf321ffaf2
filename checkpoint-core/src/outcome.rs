//! Mapping of upload outcomes to a single feedback result.

/// Combine the image and video outcome of one scan.
///
/// `None` means that class was not dispatched for the scan. If only one
/// class is defined it decides; if both are, either failure wins.
pub fn combine(image: Option<bool>, video: Option<bool>) -> Option<bool> {
    match (image, video) {
        (None, None) => None,
        (Some(ok), None) | (None, Some(ok)) => Some(ok),
        (Some(image), Some(video)) => Some(image && video),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine() {
        assert_eq!(combine(None, None), None);
        assert_eq!(combine(Some(true), None), Some(true));
        assert_eq!(combine(None, Some(false)), Some(false));
        assert_eq!(combine(Some(true), Some(true)), Some(true));
        assert_eq!(combine(Some(true), Some(false)), Some(false));
        assert_eq!(combine(Some(false), Some(true)), Some(false));
    }
}
