/// What an authenticated connection may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// May book, and cancel its own requesters' bookings.
    Client,
    /// May additionally cancel any booking.
    Operator,
}

/// Shared-secret passwords checked during the `hello` handshake.
#[derive(Debug, Clone)]
pub struct Credentials {
    password: String,
    operator_password: Option<String>,
}

impl Credentials {
    pub fn new(password: String, operator_password: Option<String>) -> Self {
        Self {
            password,
            operator_password,
        }
    }

    pub fn authenticate(&self, given: &str) -> Option<Role> {
        if self.operator_password.as_deref() == Some(given) {
            Some(Role::Operator)
        } else if self.password == given {
            Some(Role::Client)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_by_password() {
        let creds = Credentials::new("client".into(), Some("desk".into()));
        assert_eq!(creds.authenticate("client"), Some(Role::Client));
        assert_eq!(creds.authenticate("desk"), Some(Role::Operator));
        assert_eq!(creds.authenticate("nope"), None);
    }

    #[test]
    fn no_operator_password_means_no_operators() {
        let creds = Credentials::new("client".into(), None);
        assert_eq!(creds.authenticate(""), None);
        assert_eq!(creds.authenticate("client"), Some(Role::Client));
    }
}
