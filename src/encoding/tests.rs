//! Round-trip and rejection tests for the wire format.

#[allow(non_snake_case)]
mod tests {
    use crate::encoding::*;

    fn roundtrip<T: Encode + Decode + PartialEq + std::fmt::Debug>(value: T) {
        let bytes = encode_to_vec(&value).expect("encode");
        let (decoded, consumed) = decode_from_slice::<T>(&bytes).expect("decode");
        assert_eq!(decoded, value);
        assert_eq!(consumed, bytes.len(), "decoder must consume every byte");
    }

    // ================================================================
    // Primitives
    // ================================================================

    #[test]
    fn encoding__primitive_roundtrips() {
        roundtrip(0u8);
        roundtrip(255u8);
        roundtrip(0xDEAD_BEEFu32);
        roundtrip(u64::MAX);
        roundtrip(i64::MIN);
        roundtrip(i64::MAX);
        roundtrip(true);
        roundtrip(false);
    }

    #[test]
    fn encoding__integers_are_little_endian() {
        let bytes = encode_to_vec(&0x0102_0304u32).unwrap();
        assert_eq!(bytes, vec![0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn encoding__invalid_bool_byte_rejected() {
        let err = decode_from_slice::<bool>(&[0x02]).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidBool(0x02)));
    }

    // ================================================================
    // Byte strings / arrays
    // ================================================================

    #[test]
    fn encoding__byte_vec_roundtrip() {
        roundtrip(Vec::<u8>::new());
        roundtrip(b"hello".to_vec());
        roundtrip(vec![0u8; 4096]);
    }

    #[test]
    fn encoding__fixed_array_has_no_length_prefix() {
        let bytes = encode_to_vec(&*b"RUN0").unwrap();
        assert_eq!(bytes, b"RUN0");
    }

    #[test]
    fn encoding__byte_vec_length_limit_enforced() {
        // A fake length prefix above MAX_BYTE_LEN must be rejected
        // before any allocation happens.
        let bytes = encode_to_vec(&(MAX_BYTE_LEN + 1)).unwrap();
        let err = decode_from_slice::<Vec<u8>>(&bytes).unwrap_err();
        assert!(matches!(err, EncodingError::LengthOverflow(_)));
    }

    #[test]
    fn encoding__truncated_buffer_rejected() {
        let mut bytes = encode_to_vec(&b"truncate-me".to_vec()).unwrap();
        bytes.truncate(bytes.len() - 3);
        let err = decode_from_slice::<Vec<u8>>(&bytes).unwrap_err();
        assert!(matches!(err, EncodingError::UnexpectedEof { .. }));
    }

    // ================================================================
    // Option / Vec<T>
    // ================================================================

    #[test]
    fn encoding__option_roundtrip() {
        roundtrip(Option::<u64>::None);
        roundtrip(Some(42u64));
        roundtrip(Some(b"payload".to_vec()));
    }

    #[test]
    fn encoding__option_invalid_tag_rejected() {
        let err = decode_from_slice::<Option<u64>>(&[0x07]).unwrap_err();
        assert!(matches!(err, EncodingError::InvalidTag { tag: 7, .. }));
    }

    #[test]
    fn encoding__vec_of_structs_roundtrip() {
        let items: Vec<u64> = vec![1, 2, 3, u64::MAX];
        let mut buf = Vec::new();
        encode_vec(&items, &mut buf).unwrap();
        let (decoded, consumed) = decode_vec::<u64>(&buf).unwrap();
        assert_eq!(decoded, items);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn encoding__vec_element_count_limit_enforced() {
        let bytes = encode_to_vec(&(MAX_VEC_ELEMENTS + 1)).unwrap();
        let err = decode_vec::<u64>(&bytes).unwrap_err();
        assert!(matches!(err, EncodingError::LengthOverflow(_)));
    }
}
