use serde::{Deserialize, Deserializer};

/// `KEY` forwards the variable from the host, `KEY=VALUE` sets it explicitly.
#[derive(Clone, derive_more::Debug, PartialEq, Eq)]
pub(crate) struct EnvVarConfig {
    pub(crate) key: String,
    #[debug(skip)]
    pub(crate) val: Option<String>,
}

impl EnvVarConfig {
    /// Reads forwarded variables from the host and interpolates `${VAR}` references in values.
    pub(crate) fn resolve(&self) -> Result<(String, String), EnvVarMissing> {
        let val = match &self.val {
            Some(val) => interpolate_env_vars(val)?,
            None => std::env::var(&self.key).map_err(|_| EnvVarMissing(self.key.clone()))?,
        };
        Ok((self.key.clone(), val))
    }
}

struct EnvVarConfigVisitor;

impl serde::de::Visitor<'_> for EnvVarConfigVisitor {
    type Value = EnvVarConfig;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        formatter
            .write_str("either key of environment variable to be forwarded from host, or key=value")
    }

    fn visit_str<E>(self, input: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(match input.split_once('=') {
            None => EnvVarConfig {
                key: input.to_string(),
                val: None,
            },
            Some((k, input)) => EnvVarConfig {
                key: k.to_string(),
                val: Some(input.to_string()),
            },
        })
    }
}
impl<'de> Deserialize<'de> for EnvVarConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_str(EnvVarConfigVisitor)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("environment variable not set: `{0}`")]
pub(crate) struct EnvVarMissing(pub(crate) String);

pub(crate) fn interpolate_env_vars(input: &str) -> Result<String, EnvVarMissing> {
    let mut out = String::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // skip '{'
            let mut key = String::new();
            let mut closed = false;

            while let Some(&ch) = chars.peek() {
                chars.next();
                if ch == '}' {
                    closed = true;
                    break;
                }
                key.push(ch);
            }

            if !closed {
                // Unclosed `${` is kept as literal text
                out.push_str("${");
                out.push_str(&key);
            } else {
                let val = std::env::var(&key).map_err(|_| EnvVarMissing(key))?;
                out.push_str(&val);
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}
