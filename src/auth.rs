use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

/// Connection role, chosen by the startup `user` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dashboard and staff tooling: every table, every statement.
    Admin,
    /// Public booking form: submit reservations, read slots, open checkouts.
    Guest,
}

impl Role {
    pub fn from_user(user: &str) -> Option<Role> {
        match user {
            "admin" => Some(Role::Admin),
            "guest" => Some(Role::Guest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Guest => "guest",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub admin: String,
    pub guest: String,
}

impl Credentials {
    fn password_for(&self, role: Role) -> &str {
        match role {
            Role::Admin => &self.admin,
            Role::Guest => &self.guest,
        }
    }
}

#[derive(Debug)]
pub struct TavolaAuthSource {
    credentials: Credentials,
}

impl TavolaAuthSource {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthSource for TavolaAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        let Some(role) = Role::from_user(user) else {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                format!("role \"{user}\" does not exist"),
            ))));
        };
        Ok(Password::new(None, self.credentials.password_for(role).as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_by_user_name() {
        assert_eq!(Role::from_user("admin"), Some(Role::Admin));
        assert_eq!(Role::from_user("guest"), Some(Role::Guest));
        assert_eq!(Role::from_user("postgres"), None);
        assert_eq!(Role::Guest.as_str(), "guest");
    }

    #[test]
    fn each_role_has_its_own_password() {
        let creds = Credentials {
            admin: "s3cret".into(),
            guest: "public".into(),
        };
        assert_eq!(creds.password_for(Role::Admin), "s3cret");
        assert_eq!(creds.password_for(Role::Guest), "public");
    }
}
