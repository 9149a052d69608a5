use std::fmt::{Debug, Display, Formatter};

pub struct MailError(pub String);

impl Display for MailError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "MailError: {}", self.0) }
}
impl Debug for MailError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result { write!(f, "MailError({})", self.0) }
}
impl std::error::Error for MailError {}
impl From<lettre::transport::smtp::Error> for MailError {
    fn from(e: lettre::transport::smtp::Error) -> Self { MailError(e.to_string()) }
}
impl From<lettre::address::AddressError> for MailError {
    fn from(e: lettre::address::AddressError) -> Self { MailError(e.to_string()) }
}
impl From<lettre::error::Error> for MailError {
    fn from(e: lettre::error::Error) -> Self { MailError(e.to_string()) }
}