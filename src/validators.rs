use once_cell::sync::Lazy;
use regex::Regex;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9a-z._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,64}$").unwrap());

/// Checks if a string matches a standard email format.
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

/// Sign-up form rule: valid email, password of at least 8 characters that
/// matches its confirmation and is not the email itself. Returns the error
/// code of the first failing check, or None when every check passes.
pub fn sign_up_error(
    email: &str,
    password: &str,
    confirm_password: &str,
) -> Option<&'static str> {
    if !is_valid_email(email) {
        Some("invalid_email")
    } else if password.len() < 8 {
        Some("weak_password")
    } else if password != confirm_password {
        Some("password_mismatch")
    } else if email == password {
        Some("email_equals_password")
    } else {
        None
    }
}

pub fn is_sign_up_valid(email: &str, password: &str, confirm_password: &str) -> bool {
    sign_up_error(email, password, confirm_password).is_none()
}

/// Login form rule: valid email and a non-empty password.
pub fn is_login_valid(email: &str, password: &str) -> bool {
    is_valid_email(email) && !password.is_empty()
}

/// Profile form rule: a display name of at least 2 characters after trimming.
pub fn is_profile_name_valid(name: &str) -> bool {
    name.trim().len() >= 2
}
