use serde::{self, Deserialize, Deserializer, Serializer};

pub fn serialize<S>(id: &str, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(id)
}

/// Accept string or numeric ids; the editing layer emits both.
pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Str(String),
        Int(i64),
        UInt(u64),
        Float(f64),
    }

    Ok(match Option::<RawId>::deserialize(deserializer)? {
        Some(RawId::Str(s)) => s,
        Some(RawId::Int(n)) => n.to_string(),
        Some(RawId::UInt(n)) => n.to_string(),
        Some(RawId::Float(f)) => f.to_string(),
        None => String::new(),
    })
}
