use std::{collections::HashMap, sync::Arc, time::Duration};

use derive_where::derive_where;
use serde::{de::Error as SerdeError, Deserialize, Deserializer, Serialize, Serializer};
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    options::ServerAddress,
    sdam::public::ServerInfo,
};

/// The smallest max staleness a read preference may specify.
pub(crate) const SMALLEST_MAX_STALENESS: Duration = Duration::from_secs(90);

/// Staleness is only measured to the granularity of an idle write period.
pub(crate) const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// Describes which servers are suitable for a given operation.
#[derive(Clone, derive_more::Display)]
#[derive_where(Debug)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the server type, max
    /// staleness, and server tags.
    #[display("ReadPreference {_0}")]
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A `server` will be
    /// considered suitable by a `predicate` if `predicate(server)` returns true.
    #[display("Custom predicate")]
    Predicate(#[derive_where(skip)] Predicate),
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl Default for SelectionCriteria {
    fn default() -> Self {
        Self::ReadPreference(ReadPreference::Primary)
    }
}

impl SelectionCriteria {
    /// Builds a predicate selector from a closure.
    pub fn predicate(f: impl Fn(&ServerInfo) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::Predicate(..) => None,
        }
    }

    /// Selects only the server at `address`. Used to route follow-up operations to the server
    /// that served the first one.
    pub fn from_address(address: ServerAddress) -> Self {
        SelectionCriteria::Predicate(Arc::new(move |server| server.address() == &address))
    }
}

impl<'de> Deserialize<'de> for SelectionCriteria {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(SelectionCriteria::ReadPreference(
            ReadPreference::deserialize(deserializer)?,
        ))
    }
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo) -> bool>;

/// Specifies how an operation is routed to members of a replica set.
///
/// If applicable, `tag_sets` can be used to target specific nodes in a replica set, and
/// `max_staleness` specifies the maximum lag behind the primary that a secondary can be to remain
/// eligible for the operation.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary {
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to the primary if it's available, but fall back to the secondaries if
    /// not.
    PrimaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    SecondaryPreferred {
        options: Option<ReadPreferenceOptions>,
    },

    /// Route this operation to the node with the least network latency regardless of whether it's
    /// the primary or a secondary.
    Nearest {
        options: Option<ReadPreferenceOptions>,
    },
}

impl std::fmt::Display for ReadPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut mode = self.mode().to_string();
        mode[0..1].make_ascii_uppercase();
        write!(f, "{{ Mode: {}", mode)?;

        if let Some(options) = self.options() {
            if let Some(ref tag_sets) = options.tag_sets {
                write!(f, ", Tag Sets: {:?}", tag_sets)?;
            }
            if let Some(ref max_staleness) = options.max_staleness {
                write!(f, ", Max Staleness: {:?}", max_staleness)?;
            }
        }

        write!(f, " }}")
    }
}

impl<'de> Deserialize<'de> for ReadPreference {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase", deny_unknown_fields)]
        struct ReadPreferenceHelper {
            mode: String,
            #[serde(flatten)]
            options: ReadPreferenceOptions,
        }
        let helper = ReadPreferenceHelper::deserialize(deserializer)?;
        match helper.mode.to_ascii_lowercase().as_str() {
            "primary" => {
                if !helper.options.is_default() {
                    return Err(D::Error::custom(format!(
                        "cannot specify options for primary read preference, got {:?}",
                        helper.options
                    )));
                }
                Ok(ReadPreference::Primary)
            }
            "secondary" => Ok(ReadPreference::Secondary {
                options: Some(helper.options),
            }),
            "primarypreferred" => Ok(ReadPreference::PrimaryPreferred {
                options: Some(helper.options),
            }),
            "secondarypreferred" => Ok(ReadPreference::SecondaryPreferred {
                options: Some(helper.options),
            }),
            "nearest" => Ok(ReadPreference::Nearest {
                options: Some(helper.options),
            }),
            other => Err(D::Error::custom(format!(
                "Unknown read preference mode: {}",
                other
            ))),
        }
    }
}

impl Serialize for ReadPreference {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        #[serde_with::skip_serializing_none]
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct ReadPreferenceHelper<'a> {
            mode: &'static str,
            #[serde(flatten)]
            options: Option<&'a ReadPreferenceOptions>,
        }

        let helper = ReadPreferenceHelper {
            mode: self.mode(),
            options: self.options(),
        };
        helper.serialize(serializer)
    }
}

/// Specifies read preference options for non-primary read preferences.
#[serde_with::skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Specifies which replica set members should be considered for operations. Each tag set will
    /// be checked in order until one or more servers is found with each tag in the set.
    #[serde(alias = "tag_sets")]
    pub tag_sets: Option<Vec<TagSet>>,

    /// Specifies the maximum amount of lag behind the primary that a secondary can be to be
    /// considered for the given operation. Any secondaries lagging behind more than
    /// `max_staleness` will not be considered for the operation.
    ///
    /// `max_staleness` must be at least 90 seconds, and at least the heartbeat frequency plus
    /// 10 seconds. Selection fails with an invalid-argument error otherwise.
    #[serde(
        rename = "maxStalenessSeconds",
        default,
        with = "duration_option_as_int_seconds"
    )]
    pub max_staleness: Option<Duration>,
}

impl ReadPreferenceOptions {
    pub(crate) fn is_default(&self) -> bool {
        self.max_staleness.is_none()
            && self
                .tag_sets
                .as_ref()
                .map(|ts| ts.is_empty() || ts[..] == [HashMap::default()])
                .unwrap_or(true)
    }
}

impl ReadPreference {
    pub(crate) fn mode(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary { .. } => "secondary",
            Self::PrimaryPreferred { .. } => "primaryPreferred",
            Self::SecondaryPreferred { .. } => "secondaryPreferred",
            Self::Nearest { .. } => "nearest",
        }
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            Self::Primary => None,
            Self::Secondary { options }
            | Self::PrimaryPreferred { options }
            | Self::SecondaryPreferred { options }
            | Self::Nearest { options } => options.as_ref(),
        }
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.options().and_then(|options| options.max_staleness)
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options().and_then(|options| options.tag_sets.as_ref())
    }

    /// Returns a copy of this read preference that only matches servers carrying one of the
    /// given tag sets.
    pub fn with_tags(mut self, tag_sets: Vec<TagSet>) -> Result<Self> {
        let options = match self {
            Self::Primary => {
                return Err(Error::invalid_argument(
                    "read preference tags can only be specified when a non-primary mode is \
                     specified",
                ));
            }
            Self::Secondary { ref mut options }
            | Self::PrimaryPreferred { ref mut options }
            | Self::SecondaryPreferred { ref mut options }
            | Self::Nearest { ref mut options } => options,
        };

        options.get_or_insert_with(Default::default).tag_sets = Some(tag_sets);

        Ok(self)
    }

    /// Returns a copy of this read preference with the given max staleness.
    pub fn with_max_staleness(mut self, max_staleness: Duration) -> Result<Self> {
        let options = match self {
            ReadPreference::Primary => {
                return Err(Error::invalid_argument(
                    "max staleness can only be specified when a non-primary mode is specified",
                ));
            }
            ReadPreference::Secondary { ref mut options }
            | ReadPreference::PrimaryPreferred { ref mut options }
            | ReadPreference::SecondaryPreferred { ref mut options }
            | ReadPreference::Nearest { ref mut options } => options,
        };

        options.get_or_insert_with(Default::default).max_staleness = Some(max_staleness);

        Ok(self)
    }
}

/// A read preference tag set.
pub type TagSet = HashMap<String, String>;

mod duration_option_as_int_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        val: &Option<Duration>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match val {
            Some(duration) if duration.as_secs() > i32::MAX as u64 => {
                serializer.serialize_i64(duration.as_secs() as i64)
            }
            Some(duration) => serializer.serialize_i32(duration.as_secs() as i32),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D>(
        deserializer: D,
    ) -> std::result::Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = Option::<i64>::deserialize(deserializer)?;
        // A negative value means "no max staleness".
        Ok(seconds.and_then(|s| u64::try_from(s).ok().map(Duration::from_secs)))
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::{ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet};
    use crate::bson::doc;

    #[test]
    fn read_preference_serializes_mode_and_options() {
        let tags: TagSet = [("dc".to_string(), "ny".to_string())].into_iter().collect();
        let read_pref = ReadPreference::Secondary {
            options: Some(
                ReadPreferenceOptions::builder()
                    .tag_sets(vec![tags])
                    .max_staleness(Duration::from_secs(120))
                    .build(),
            ),
        };
        let doc = crate::bson::to_document(&read_pref).unwrap();

        assert_eq!(
            doc,
            doc! { "mode": "secondary", "tagSets": [{ "dc": "ny" }], "maxStalenessSeconds": 120 }
        );
    }

    #[test]
    fn primary_with_options_rejected() {
        let doc = doc! { "mode": "primary", "maxStalenessSeconds": 120 };
        assert!(crate::bson::from_document::<ReadPreference>(doc).is_err());

        let read_pref: ReadPreference =
            crate::bson::from_document(doc! { "mode": "primary" }).unwrap();
        assert_eq!(read_pref, ReadPreference::Primary);
    }

    #[test]
    fn negative_max_staleness_means_none() {
        let read_pref: ReadPreference = crate::bson::from_document(
            doc! { "mode": "nearest", "maxStalenessSeconds": -1 },
        )
        .unwrap();
        assert_eq!(read_pref.max_staleness(), None);
    }

    #[test]
    fn primary_rejects_tags_and_staleness() {
        assert!(ReadPreference::Primary.with_tags(vec![]).is_err());
        assert!(ReadPreference::Primary
            .with_max_staleness(Duration::from_secs(90))
            .is_err());

        let read_pref = ReadPreference::Nearest { options: None }
            .with_max_staleness(Duration::from_secs(90))
            .unwrap();
        assert_eq!(read_pref.max_staleness(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn display() {
        let criteria = SelectionCriteria::from(ReadPreference::PrimaryPreferred { options: None });
        assert_eq!(criteria.to_string(), "ReadPreference { Mode: PrimaryPreferred }");
        assert_eq!(
            SelectionCriteria::predicate(|_| true).to_string(),
            "Custom predicate"
        );
    }
}
