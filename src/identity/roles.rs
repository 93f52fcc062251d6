//! Role bindings: role name to dial-capable service attributes

use std::fmt;
use std::str::FromStr;

use crate::config::ServiceNames;

use super::error::IdentityError;

/// Roles an identity can be created with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    Enroller,
    Device,
    DevicePendingEnroll,
    Inactive,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Admin,
        Role::Enroller,
        Role::Device,
        Role::DevicePendingEnroll,
        Role::Inactive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Enroller => "enroller",
            Role::Device => "device",
            Role::DevicePendingEnroll => "device-pending-enroll",
            Role::Inactive => "inactive",
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }

    /// Role attributes in their fixed order
    pub fn attributes(&self, services: &ServiceNames) -> Vec<String> {
        let names: Vec<&str> = match self {
            Role::Admin => vec![
                services.api.as_str(),
                services.frontend.as_str(),
                services.rtc.as_str(),
                services.livekit.as_str(),
                services.turn.as_str(),
                services.zac.as_str(),
            ],
            Role::Enroller | Role::DevicePendingEnroll => vec![services.dmz.as_str()],
            Role::Device => vec![
                services.rtc.as_str(),
                services.livekit.as_str(),
                services.nats.as_str(),
                services.turn.as_str(),
            ],
            Role::Inactive => Vec::new(),
        };
        names.into_iter().map(|name| format!("{}.dial", name)).collect()
    }
}

impl FromStr for Role {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| IdentityError::UnknownRole(s.to_string()))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attributes for a role given by name
pub fn role_attributes(role: &str, services: &ServiceNames) -> Result<Vec<String>, IdentityError> {
    Ok(role.parse::<Role>()?.attributes(services))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services() -> ServiceNames {
        ServiceNames {
            api: "service-api".to_string(),
            frontend: "frontend".to_string(),
            rtc: "rtc".to_string(),
            livekit: "livekit".to_string(),
            nats: "nats".to_string(),
            turn: "turn".to_string(),
            zac: "zac".to_string(),
            dmz: "dmz".to_string(),
        }
    }

    #[test]
    fn test_device_attributes_in_order() {
        assert_eq!(
            role_attributes("device", &services()).unwrap(),
            vec!["rtc.dial", "livekit.dial", "nats.dial", "turn.dial"]
        );
    }

    #[test]
    fn test_admin_attributes() {
        assert_eq!(
            role_attributes("admin", &services()).unwrap(),
            vec![
                "service-api.dial",
                "frontend.dial",
                "rtc.dial",
                "livekit.dial",
                "turn.dial",
                "zac.dial"
            ]
        );
    }

    #[test]
    fn test_enroller_roles_share_dmz() {
        let s = services();
        assert_eq!(role_attributes("enroller", &s).unwrap(), vec!["dmz.dial"]);
        assert_eq!(
            role_attributes("device-pending-enroll", &s).unwrap(),
            vec!["dmz.dial"]
        );
    }

    #[test]
    fn test_inactive_is_empty_not_error() {
        assert!(role_attributes("inactive", &services()).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_role() {
        assert!(matches!(
            role_attributes("superuser", &services()),
            Err(IdentityError::UnknownRole(r)) if r == "superuser"
        ));
    }

    #[test]
    fn test_round_trip_names() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!(Role::Admin.is_admin());
        assert!(!Role::Device.is_admin());
    }
}
