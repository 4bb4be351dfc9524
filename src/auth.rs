use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Login name that gets the admin role.
pub const ADMIN_USER: &str = "admin";

/// What a session may do, decided by its login name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Consumer,
}

impl Role {
    pub fn for_user(user: Option<&str>) -> Self {
        match user {
            Some(ADMIN_USER) => Role::Admin,
            _ => Role::Consumer,
        }
    }
}

/// Cleartext password source: one password for the admin login, another
/// shared by every other login.
#[derive(Debug)]
pub struct CanchasAuthSource {
    consumer_password: String,
    admin_password: String,
}

impl CanchasAuthSource {
    pub fn new(consumer_password: String, admin_password: String) -> Self {
        Self {
            consumer_password,
            admin_password,
        }
    }

    fn password_for(&self, role: Role) -> &str {
        match role {
            Role::Admin => &self.admin_password,
            Role::Consumer => &self.consumer_password,
        }
    }
}

#[async_trait]
impl AuthSource for CanchasAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let role = Role::for_user(login.user());
        Ok(Password::new(None, self.password_for(role).as_bytes().to_vec()))
    }
}
