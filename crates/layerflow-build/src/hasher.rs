//! シグネチャ用のハッシュ関数
//!
//! 引数を平坦化し、`None` を除いて `:::` で連結した文字列の SHA-256 を
//! 小文字の16進で返します。

use sha2::{Digest, Sha256};

const SEPARATOR: &str = ":::";

/// ハッシュの入力値
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashInput {
    Value(String),
    List(Vec<HashInput>),
    Nil,
}

impl HashInput {
    fn flatten_into(self, out: &mut Vec<String>) {
        match self {
            HashInput::Value(value) => out.push(value),
            HashInput::List(items) => {
                for item in items {
                    item.flatten_into(out);
                }
            }
            HashInput::Nil => {}
        }
    }
}

impl From<String> for HashInput {
    fn from(value: String) -> Self {
        HashInput::Value(value)
    }
}

impl From<&String> for HashInput {
    fn from(value: &String) -> Self {
        HashInput::Value(value.clone())
    }
}

impl From<&str> for HashInput {
    fn from(value: &str) -> Self {
        HashInput::Value(value.to_string())
    }
}

impl<T: Into<HashInput>> From<Option<T>> for HashInput {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(HashInput::Nil)
    }
}

impl<T: Into<HashInput>> From<Vec<T>> for HashInput {
    fn from(values: Vec<T>) -> Self {
        HashInput::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<&[String]> for HashInput {
    fn from(values: &[String]) -> Self {
        HashInput::List(values.iter().map(HashInput::from).collect())
    }
}

/// 異なる型の値を [`HashInput`] のリストにする
///
/// ```
/// use layerflow_build::{hash_inputs, hashsum};
/// let cache_version: Option<&str> = None;
/// assert_eq!(hashsum(hash_inputs!["a", cache_version]), hashsum(hash_inputs!["a"]));
/// ```
#[macro_export]
macro_rules! hash_inputs {
    ($($value:expr),* $(,)?) => {
        vec![$($crate::hasher::HashInput::from($value)),*]
    };
}

/// 入力を連結した SHA-256
pub fn hashsum<I>(inputs: I) -> String
where
    I: IntoIterator,
    I::Item: Into<HashInput>,
{
    let mut parts = Vec::new();
    for input in inputs {
        input.into().flatten_into(&mut parts);
    }
    sha256_hex(parts.join(SEPARATOR).as_bytes())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashsum_is_sha256_of_joined_values() {
        assert_eq!(hashsum(["a", "b"]), sha256_hex(b"a:::b"));
        assert_eq!(hashsum(["a", "b"]).len(), 64);
    }

    #[test]
    fn test_nil_is_dropped_and_lists_are_flattened() {
        let nested = hash_inputs!["a", vec!["b", "c"], None::<String>];
        assert_eq!(hashsum(nested), hashsum(["a", "b", "c"]));
    }

    #[test]
    fn test_order_matters() {
        assert_ne!(hashsum(["a", "b"]), hashsum(["b", "a"]));
    }
}
