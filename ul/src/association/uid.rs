use std::borrow::Cow;

/// Strip the trailing characters which may appear
/// in UIDs taken directly from DICOM objects:
/// whitespace and the null padding byte.
pub fn trim_uid(uid: Cow<'_, str>) -> Cow<'_, str> {
    if uid.ends_with(|c: char| c.is_whitespace() || c == '\0') {
        uid.trim_end_matches(|c: char| c.is_whitespace() || c == '\0')
            .to_string()
            .into()
    } else {
        uid
    }
}

#[cfg(test)]
mod tests {
    use super::trim_uid;
    use std::borrow::Cow;

    #[test]
    fn trims_padding_only_when_present() {
        assert_eq!(trim_uid(Cow::from("1.2.840.10008.1.1")), "1.2.840.10008.1.1");
        assert_eq!(trim_uid(Cow::from("1.2.840.10008.1.1\0")), "1.2.840.10008.1.1");
        assert_eq!(trim_uid(Cow::from("1.2.840.10008.1.1 ")), "1.2.840.10008.1.1");
    }
}
