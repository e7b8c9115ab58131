use super::*;

/// A `mining.notify` job exactly as the pool framed it. All fields stay raw
/// hex strings so the record preserves what the pool actually sent.
#[derive(Debug, Clone, PartialEq)]
pub struct Notify {
    pub job_id: String,
    pub prev_hash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    pub merkle_branches: Vec<String>,
    pub version: String,
    pub nbits: String,
    pub ntime: String,
    pub clean_jobs: bool,
}

impl Serialize for Notify {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(9))?;
        seq.serialize_element(&self.job_id)?;
        seq.serialize_element(&self.prev_hash)?;
        seq.serialize_element(&self.coinbase1)?;
        seq.serialize_element(&self.coinbase2)?;
        seq.serialize_element(&self.merkle_branches)?;
        seq.serialize_element(&self.version)?;
        seq.serialize_element(&self.nbits)?;
        seq.serialize_element(&self.ntime)?;
        seq.serialize_element(&self.clean_jobs)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for Notify {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (
            job_id,
            prev_hash,
            coinbase1,
            coinbase2,
            merkle_branches,
            version,
            nbits,
            ntime,
            clean_jobs,
        ) = <(
            String,
            String,
            String,
            String,
            Vec<String>,
            String,
            String,
            String,
            bool,
        )>::deserialize(deserializer)?;

        Ok(Notify {
            job_id,
            prev_hash,
            coinbase1,
            coinbase2,
            merkle_branches,
            version,
            nbits,
            ntime,
            clean_jobs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_params_roundtrip() {
        let json = r#"["ab12","00000000000000000000a1b2c3d4e5f60000000000000000000000000000beef","01000000","ffffffff",["aa","bb"],"20000000","17038a6d","66b0a1c2",true]"#;

        let notify: Notify = serde_json::from_str(json).unwrap();

        assert_eq!(notify.job_id, "ab12");
        assert_eq!(notify.merkle_branches, vec!["aa", "bb"]);
        assert!(notify.clean_jobs);

        let lhs: Value = serde_json::from_str(json).unwrap();
        let rhs = serde_json::to_value(&notify).unwrap();
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn notify_empty_merkle_branches() {
        let json = r#"["1","beef","aa","bb",[],"20000000","17038a6d","66b0a1c2",false]"#;
        let notify: Notify = serde_json::from_str(json).unwrap();
        assert!(notify.merkle_branches.is_empty());
    }

    #[test]
    fn notify_wrong_arity_rejected() {
        assert!(serde_json::from_str::<Notify>(r#"["1","beef","aa","bb",[]]"#).is_err());
    }
}
