//! VO-based authorization: who may reserve in a link group, and who may
//! release a reservation.
//!
//! Callers are identified by VOMS attributes ("FQANs") of the form
//! `/group[/subgroup...][/Role=role]`.  A link group carries a list of
//! [`VoRule`]s; each rule matches a group and a role, either exactly or
//! with a wildcard.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::err::Error;
use crate::types::Space;

/// The textual wildcard used in the authorization file and in storage.
pub(crate) const WILDCARD: &str = "*";

/// How one field of a [`VoRule`] matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(clippy::exhaustive_enums)]
pub enum VoMatch {
    /// Matches any value, including an absent one.
    Any,
    /// Matches exactly this value.
    Exact(String),
}

impl VoMatch {
    /// Return true if `value` satisfies this rule field.
    pub fn matches(&self, value: Option<&str>) -> bool {
        match self {
            VoMatch::Any => true,
            VoMatch::Exact(want) => value == Some(want.as_str()),
        }
    }

    /// Return the stored representation.
    pub(crate) fn as_stored(&self) -> &str {
        match self {
            VoMatch::Any => WILDCARD,
            VoMatch::Exact(s) => s,
        }
    }

    /// Parse a stored or configured value; `*` means [`VoMatch::Any`].
    pub(crate) fn from_stored(s: &str) -> Self {
        if s == WILDCARD {
            VoMatch::Any
        } else {
            VoMatch::Exact(s.to_owned())
        }
    }
}

impl fmt::Display for VoMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_stored())
    }
}

/// One entry of a link group's allow-list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct VoRule {
    /// Which groups match.
    pub group: VoMatch,
    /// Which roles match.
    pub role: VoMatch,
}

impl VoRule {
    /// Return a rule matching everybody.
    pub fn any() -> Self {
        VoRule {
            group: VoMatch::Any,
            role: VoMatch::Any,
        }
    }

    /// Return a rule from its stored representation.
    pub fn from_stored(group: &str, role: &str) -> Self {
        VoRule {
            group: VoMatch::from_stored(group),
            role: VoMatch::from_stored(role),
        }
    }

    /// Return true if `id` is allowed by this rule.
    pub fn matches(&self, id: &VoIdentity) -> bool {
        self.group.matches(Some(&id.group)) && self.role.matches(id.role.as_deref())
    }
}

impl FromStr for VoRule {
    type Err = Error;

    /// Parse an FQAN pattern such as `/atlas/Role=*` or `*`.
    ///
    /// A missing role matches any role.
    fn from_str(s: &str) -> Result<Self, Error> {
        let (group, role) = split_fqan(s)?;
        Ok(VoRule {
            group: VoMatch::from_stored(group),
            role: role.map_or(VoMatch::Any, VoMatch::from_stored),
        })
    }
}

impl fmt::Display for VoRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/Role={}", self.group, self.role)
    }
}

/// A concrete VO group and (optional) role held by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct VoIdentity {
    /// The group, e.g. `/atlas/higgs`.
    pub group: String,
    /// The role, if any.
    pub role: Option<String>,
}

impl VoIdentity {
    /// Construct an identity.
    pub fn new(group: impl Into<String>, role: Option<&str>) -> Self {
        VoIdentity {
            group: group.into(),
            role: role.map(str::to_owned),
        }
    }
}

impl FromStr for VoIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let (group, role) = split_fqan(s)?;
        // "Role=NULL" is how VOMS spells "no role".
        let role = role.filter(|r| !r.eq_ignore_ascii_case("NULL"));
        Ok(VoIdentity::new(group, role))
    }
}

impl fmt::Display for VoIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.role {
            Some(role) => write!(f, "{}/Role={}", self.group, role),
            None => f.write_str(&self.group),
        }
    }
}

/// Split an FQAN into its group and role parts.
///
/// Capability attributes are ignored.
fn split_fqan(s: &str) -> Result<(&str, Option<&str>), Error> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::InvalidArgument("empty FQAN".into()));
    }
    let s = s.split("/Capability=").next().unwrap_or(s);
    match s.split_once("/Role=") {
        Some((group, role)) if !group.is_empty() && !role.is_empty() => Ok((group, Some(role))),
        Some(_) => Err(Error::InvalidArgument(format!("malformed FQAN {:?}", s))),
        None => Ok((s, None)),
    }
}

/// The owner recorded on a reservation or file.
///
/// `None` in either field means unrestricted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct VoOwner {
    /// Owning group.
    pub group: Option<String>,
    /// Owning role.
    pub role: Option<String>,
}

impl VoOwner {
    /// Construct an owner from explicit values.
    pub fn new(group: Option<&str>, role: Option<&str>) -> Self {
        VoOwner {
            group: group.map(str::to_owned),
            role: role.map(str::to_owned),
        }
    }
}

/// A caller of the space manager.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[allow(clippy::exhaustive_structs)]
pub struct Subject {
    /// The caller's user name, if known.
    pub user: Option<String>,
    /// The caller's primary VO identity.
    pub primary: Option<VoIdentity>,
    /// Every other group attribute the caller holds.
    #[serde(default)]
    pub fqans: Vec<VoIdentity>,
}

impl Subject {
    /// Construct a subject whose only identity is the FQAN `fqan`.
    pub fn from_fqan(fqan: &str) -> Result<Self, Error> {
        Ok(Subject {
            user: None,
            primary: Some(fqan.parse()?),
            fqans: Vec::new(),
        })
    }

    /// Construct a subject with a primary FQAN followed by further
    /// attributes, the way a VOMS proxy lists them.
    pub fn from_fqans<'a>(fqans: impl IntoIterator<Item = &'a str>) -> Result<Self, Error> {
        let mut ids = fqans
            .into_iter()
            .map(str::parse)
            .collect::<Result<Vec<VoIdentity>, _>>()?
            .into_iter();
        Ok(Subject {
            user: None,
            primary: ids.next(),
            fqans: ids.collect(),
        })
    }

    /// Iterate over the primary identity followed by every group attribute.
    pub fn identities(&self) -> impl Iterator<Item = &VoIdentity> {
        self.primary.iter().chain(self.fqans.iter())
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.primary, &self.user) {
            (Some(id), _) => write!(f, "{}", id),
            (None, Some(user)) => f.write_str(user),
            (None, None) => f.write_str("<anonymous>"),
        }
    }
}

/// Decide whether `subject` may reserve in a link group with allow-list
/// `rules`.
///
/// Rules are tried in order; for each, the primary identity is tried before
/// the remaining group attributes.  The first match wins and determines the
/// owner recorded on the new reservation: exact rule fields are taken from
/// the rule, wildcard fields from the matching identity.
pub(crate) fn check_reserve(subject: &Subject, rules: &[VoRule]) -> Result<VoOwner, Error> {
    for rule in rules {
        if let Some(id) = subject.identities().find(|id| rule.matches(id)) {
            let group = match &rule.group {
                VoMatch::Exact(g) => g.clone(),
                VoMatch::Any => id.group.clone(),
            };
            let role = match &rule.role {
                VoMatch::Exact(r) => Some(r.clone()),
                VoMatch::Any => id.role.clone(),
            };
            return Ok(VoOwner {
                group: Some(group),
                role,
            });
        }
    }
    Err(Error::Authorization(format!(
        "{} is not allowed to reserve here",
        subject
    )))
}

/// Decide whether `subject` may release `space`.
///
/// An unrestricted field on the reservation matches anything.  A
/// reservation owned by a group name equal to the caller's user name (and no
/// role) belongs to that user.
pub(crate) fn check_release(subject: &Subject, space: &Space) -> Result<(), Error> {
    let group = space.vo_group.as_deref();
    let role = space.vo_role.as_deref();

    if group.is_none() && role.is_none() {
        return Ok(());
    }
    if role.is_none() && group.is_some() && group == subject.user.as_deref() {
        return Ok(());
    }
    let allowed = subject.identities().any(|id| {
        group.is_none_or(|g| g == id.group) && role.is_none_or(|r| Some(r) == id.role.as_deref())
    });
    if allowed {
        Ok(())
    } else {
        Err(Error::Authorization(format!(
            "{} does not own space reservation {}",
            subject, space.id
        )))
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_time_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;
    use crate::types::*;

    fn space(group: Option<&str>, role: Option<&str>) -> Space {
        Space {
            id: SpaceToken::new(7),
            link_group_id: LinkGroupId::new(1),
            vo_group: group.map(Into::into),
            vo_role: role.map(Into::into),
            retention_policy: RetentionPolicy::Custodial,
            access_latency: AccessLatency::Nearline,
            size: 10,
            creation_time: Timestamp::from_millis(0),
            lifetime: Lifetime::Infinite,
            description: None,
            state: SpaceState::Reserved,
            used: 0,
            allocated: 0,
        }
    }

    #[test]
    fn parse_fqans() {
        let id: VoIdentity = "/atlas/Role=production".parse().unwrap();
        assert_eq!(id, VoIdentity::new("/atlas", Some("production")));
        let id: VoIdentity = "/atlas/higgs/Role=NULL/Capability=NULL".parse().unwrap();
        assert_eq!(id, VoIdentity::new("/atlas/higgs", None));
        assert!("".parse::<VoIdentity>().is_err());
        assert!("/atlas/Role=".parse::<VoIdentity>().is_err());

        let rule: VoRule = "*/Role=*".parse().unwrap();
        assert_eq!(rule, VoRule::any());
        let rule: VoRule = "/cms".parse().unwrap();
        assert_eq!(rule.group, VoMatch::Exact("/cms".into()));
        assert_eq!(rule.role, VoMatch::Any);
        assert_eq!(rule.to_string(), "/cms/Role=*");
    }

    #[test]
    fn reserve_rules() {
        let subject = Subject::from_fqan("/A/Role=X").unwrap();

        let only_b = vec![VoRule::from_stored("/B", "*")];
        assert!(matches!(
            check_reserve(&subject, &only_b),
            Err(Error::Authorization(_))
        ));

        let owner = check_reserve(&subject, &[VoRule::any()]).unwrap();
        assert_eq!(owner, VoOwner::new(Some("/A"), Some("X")));

        let exact_role = vec![VoRule::from_stored("*", "admin")];
        assert!(check_reserve(&subject, &exact_role).is_err());
    }

    #[test]
    fn reserve_uses_secondary_attributes() {
        let subject = Subject::from_fqans(["/A/Role=X", "/B/higgs"]).unwrap();
        let rules = vec![
            VoRule::from_stored("/C", "*"),
            VoRule::from_stored("/B/higgs", "*"),
        ];
        let owner = check_reserve(&subject, &rules).unwrap();
        assert_eq!(owner, VoOwner::new(Some("/B/higgs"), None));
    }

    #[test]
    fn release_rules() {
        let subject = Subject::from_fqans(["/A/Role=X", "/B"]).unwrap();
        assert!(check_release(&subject, &space(None, None)).is_ok());
        assert!(check_release(&subject, &space(Some("/A"), Some("X"))).is_ok());
        assert!(check_release(&subject, &space(Some("/A"), None)).is_ok());
        assert!(check_release(&subject, &space(Some("/B"), None)).is_ok());
        assert!(check_release(&subject, &space(Some("/B"), Some("X"))).is_err());
        assert!(check_release(&subject, &space(Some("/C"), None)).is_err());

        let user = Subject {
            user: Some("alice".into()),
            ..Subject::default()
        };
        assert!(check_release(&user, &space(Some("alice"), None)).is_ok());
        assert!(check_release(&user, &space(Some("bob"), None)).is_err());
    }
}
