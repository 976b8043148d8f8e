use std::borrow::{Borrow, Cow};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ValidationError;

const MAX_PROVIDER_ID_LEN: usize = 64;

/// Identifier of an external data provider, e.g. `USGS` or `FEMA`.
///
/// Case is preserved; only ASCII alphanumerics, `_` and `-` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderId(Cow<'static, str>);

impl ProviderId {
    /// Build an identifier from a literal known to be valid.
    pub const fn from_static(value: &'static str) -> Self {
        Self(Cow::Borrowed(value))
    }

    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(ValidationError::EmptyProviderId);
        }
        if value.len() > MAX_PROVIDER_ID_LEN {
            return Err(ValidationError::ProviderIdTooLong {
                len: value.len(),
                max: MAX_PROVIDER_ID_LEN,
            });
        }
        if let Some((index, ch)) = value
            .char_indices()
            .find(|(_, ch)| !is_identifier_char(*ch))
        {
            return Err(ValidationError::ProviderIdInvalidChar { ch, index });
        }

        Ok(Self(Cow::Owned(value.to_owned())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ProviderId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for ProviderId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ProviderId> for String {
    fn from(value: ProviderId) -> Self {
        value.0.into_owned()
    }
}

impl Borrow<str> for ProviderId {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

/// Hazard data category a provider can serve. Always lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Category(Cow<'static, str>);

impl Category {
    pub const EARTHQUAKE_RISK: Self = Self(Cow::Borrowed("earthquake_risk"));
    pub const FLOOD_RISK: Self = Self(Cow::Borrowed("flood_risk"));
    pub const STORM_RISK: Self = Self(Cow::Borrowed("storm_risk"));
    pub const FIRE_RISK: Self = Self(Cow::Borrowed("fire_risk"));
    pub const GEOCODING: Self = Self(Cow::Borrowed("geocoding"));
    pub const FLOOD_ZONE_BOUNDARY: Self = Self(Cow::Borrowed("flood_zone_boundary"));
    pub const WEATHER_ALERTS: Self = Self(Cow::Borrowed("weather_alerts"));

    pub const WELL_KNOWN: [Self; 7] = [
        Self::EARTHQUAKE_RISK,
        Self::FLOOD_RISK,
        Self::STORM_RISK,
        Self::FIRE_RISK,
        Self::GEOCODING,
        Self::FLOOD_ZONE_BOUNDARY,
        Self::WEATHER_ALERTS,
    ];

    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let value = value.trim().to_ascii_lowercase();
        if value.is_empty() {
            return Err(ValidationError::EmptyCategory);
        }
        if let Some((index, ch)) = value
            .char_indices()
            .find(|(_, ch)| !is_identifier_char(*ch))
        {
            return Err(ValidationError::CategoryInvalidChar { ch, index });
        }

        Ok(Self(Cow::Owned(value)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl TryFrom<String> for Category {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Category> for String {
    fn from(value: Category) -> Self {
        value.0.into_owned()
    }
}

impl Borrow<str> for Category {
    fn borrow(&self) -> &str {
        self.as_str()
    }
}

/// Ownership class of a provider, used as a caller constraint on `fetch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Government,
    Commercial,
    Community,
}

impl SourceType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Government => "government",
            Self::Commercial => "commercial",
            Self::Community => "community",
        }
    }
}

impl Display for SourceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "government" => Ok(Self::Government),
            "commercial" => Ok(Self::Commercial),
            "community" => Ok(Self::Community),
            other => Err(ValidationError::InvalidSourceType {
                value: other.to_owned(),
            }),
        }
    }
}

fn is_identifier_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'
}
