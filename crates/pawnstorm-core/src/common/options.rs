use crate::Error;
use core::{fmt, str::FromStr};

/// One UCI engine option as carried in `new_game`.
///
/// On the wire an option is `"name value"` or just `"name"` for buttons and
/// options reset to their default. Names containing spaces cannot be
/// expressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOption {
    pub name: String,
    pub value: Option<String>,
}

impl EngineOption {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Parses every option string, failing on the first bad one.
    pub fn parse_all<S: AsRef<str>>(options: &[S]) -> Result<Vec<Self>, Error> {
        options.iter().map(|o| o.as_ref().parse()).collect()
    }
}

impl FromStr for EngineOption {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace();
        match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(name), value, None) => Ok(Self {
                name: name.to_owned(),
                value: value.map(str::to_owned),
            }),
            _ => Err(Error::InvalidOption {
                option: s.to_owned(),
            }),
        }
    }
}

impl fmt::Display for EngineOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{} {}", self.name, value),
            None => f.write_str(&self.name),
        }
    }
}
