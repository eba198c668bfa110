//! Serde helpers for byte payloads in JSON records.
//!
//! Payloads are written as standard base64 strings. Decoding is lenient and
//! also accepts a plain array of byte values, which is how a default serde
//! `Vec<u8>` would have been serialized.

/// `#[serde(with = "base64_bytes")]` for `Vec<u8>` fields.
pub mod base64_bytes {
    use base64::Engine;
    use serde::de::{self, Deserializer, SeqAccess, Visitor};
    use serde::Serializer;
    use std::fmt;

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct BytesVisitor;

        impl<'de> Visitor<'de> for BytesVisitor {
            type Value = Vec<u8>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a base64 string or a sequence of bytes")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                base64::engine::general_purpose::STANDARD
                    .decode(v)
                    .map_err(|e| E::custom(format!("invalid base64 payload: {e}")))
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                Ok(v.to_vec())
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(byte) = seq.next_element::<u8>()? {
                    out.push(byte);
                }
                Ok(out)
            }

            // null payload
            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(Vec::new())
            }
        }

        deserializer.deserialize_any(BytesVisitor)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Blob {
        #[serde(with = "super::base64_bytes")]
        data: Vec<u8>,
    }

    #[test]
    fn test_encodes_as_base64() {
        let json = serde_json::to_string(&Blob {
            data: vec![0, 1, 2, 255],
        })
        .unwrap();
        assert_eq!(json, r#"{"data":"AAEC/w=="}"#);
    }

    #[test]
    fn test_accepts_byte_array() {
        let blob: Blob = serde_json::from_str(r#"{"data":[104,105]}"#).unwrap();
        assert_eq!(blob.data, b"hi");
    }

    #[test]
    fn test_null_is_empty() {
        let blob: Blob = serde_json::from_str(r#"{"data":null}"#).unwrap();
        assert!(blob.data.is_empty());
    }

    #[test]
    fn test_rejects_bad_base64() {
        assert!(serde_json::from_str::<Blob>(r#"{"data":"***"}"#).is_err());
    }
}
