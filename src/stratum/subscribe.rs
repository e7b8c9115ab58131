use super::*;

/// The interesting tail of a `mining.subscribe` response. Pools pad the
/// result array in different ways, but the last two elements are always
/// `extranonce1` and `extranonce2_length`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeResult {
    pub extranonce1: String,
    pub extranonce2_length: i64,
}

impl SubscribeResult {
    /// Snoops a subscribe-shaped `result` value. Returns `None` unless the
    /// value is an array of at least two elements ending in a hex string and
    /// an integer.
    pub fn from_result(result: &Value) -> Option<Self> {
        let elements = result.as_array()?;

        if elements.len() < 2 {
            return None;
        }

        let extranonce1 = elements[elements.len() - 2].as_str()?.to_string();
        let extranonce2_length = elements[elements.len() - 1].as_i64()?;

        Some(SubscribeResult {
            extranonce1,
            extranonce2_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_subscribe_result() {
        let result = json!([
            [
                ["mining.set_difficulty", "b4b6693b72a50c7116db18d6497cac52"],
                ["mining.notify", "ae6812eb4cd7735a302a8a9dd95cf71f"]
            ],
            "08000002",
            4
        ]);

        assert_eq!(
            SubscribeResult::from_result(&result),
            Some(SubscribeResult {
                extranonce1: "08000002".into(),
                extranonce2_length: 4,
            })
        );
    }

    #[test]
    fn takes_last_two_of_longer_arrays() {
        let result = json!(["noise", "more", "deadbeef", 8]);

        assert_eq!(
            SubscribeResult::from_result(&result),
            Some(SubscribeResult {
                extranonce1: "deadbeef".into(),
                extranonce2_length: 8,
            })
        );
    }

    #[test]
    fn rejects_non_subscribe_shapes() {
        assert_eq!(SubscribeResult::from_result(&json!(true)), None);
        assert_eq!(SubscribeResult::from_result(&json!(["only"])), None);
        assert_eq!(SubscribeResult::from_result(&json!(["a", "b"])), None);
        assert_eq!(SubscribeResult::from_result(&json!([1, "tail"])), None);
    }
}
