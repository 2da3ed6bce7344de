use crate::server::response::ApiError;

const MAX_USERNAME_LEN: usize = 64;
const MAX_STACK_NAME_LEN: usize = 64;
const MAX_ROLE_NAME_LEN: usize = 64;
const MAX_CONTAINER_NAME_LEN: usize = 128;
const MAX_SERVER_NAME_LEN: usize = 100;
const MAX_API_KEY_NAME_LEN: usize = 100;
const MAX_EMAIL_LEN: usize = 254;

fn is_valid_name_char(c: char, allow_period: bool) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || (allow_period && c == '.')
}

fn validate_name(
    name: &str,
    entity: &str,
    max_len: usize,
    allow_period: bool,
    forbid_leading_special: bool,
) -> Result<(), String> {
    if name.is_empty() {
        return Err(format!("{entity} name cannot be empty"));
    }
    if name.len() > max_len {
        return Err(format!("{entity} name cannot exceed {max_len} characters"));
    }
    if !name.chars().all(|c| is_valid_name_char(c, allow_period)) {
        let mut allowed = "alphanumeric characters, hyphens, and underscores".to_string();
        if allow_period {
            allowed.push_str(", and periods");
        }
        return Err(format!("{entity} name can only contain {allowed}"));
    }
    if forbid_leading_special && (name.starts_with('-') || name.starts_with('_')) {
        return Err(format!(
            "{entity} name cannot start with a hyphen or underscore"
        ));
    }
    Ok(())
}

pub fn validate_username(name: &str) -> Result<(), ApiError> {
    validate_name(name, "User", MAX_USERNAME_LEN, true, true).map_err(ApiError::bad_request)
}

/// Stack names become compose project names on the agent.
pub fn validate_stack_name(name: &str) -> Result<(), ApiError> {
    validate_name(name, "Stack", MAX_STACK_NAME_LEN, false, true).map_err(ApiError::bad_request)
}

/// Container names as Docker accepts them: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
pub fn validate_container_name(name: &str) -> Result<(), ApiError> {
    let starts_alnum = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
    if !starts_alnum {
        return Err(ApiError::bad_request("Invalid container name"));
    }
    validate_name(name, "Container", MAX_CONTAINER_NAME_LEN, true, true)
        .map_err(ApiError::bad_request)
}

pub fn validate_role_name(name: &str) -> Result<(), ApiError> {
    validate_name(name, "Role", MAX_ROLE_NAME_LEN, true, true).map_err(ApiError::bad_request)
}

fn validate_label(name: &str, entity: &str, max_len: usize) -> Result<(), ApiError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ApiError::bad_request(format!("{entity} name cannot be empty")));
    }
    if trimmed.len() > max_len {
        return Err(ApiError::bad_request(format!(
            "{entity} name cannot exceed {max_len} characters"
        )));
    }
    Ok(())
}

pub fn validate_server_name(name: &str) -> Result<(), ApiError> {
    validate_label(name, "Server", MAX_SERVER_NAME_LEN)
}

pub fn validate_api_key_name(name: &str) -> Result<(), ApiError> {
    validate_label(name, "API key", MAX_API_KEY_NAME_LEN)
}

pub fn validate_email(email: &str) -> Result<(), ApiError> {
    let valid = email.len() <= MAX_EMAIL_LEN
        && !email.chars().any(char::is_whitespace)
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if valid {
        Ok(())
    } else {
        Err(ApiError::bad_request("Invalid email address"))
    }
}

pub fn validate_host(host: &str) -> Result<(), ApiError> {
    let valid = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'));
    if valid {
        Ok(())
    } else {
        Err(ApiError::bad_request("Invalid host"))
    }
}

/// Relative path inside a stack directory: no absolute paths and no `..` segments.
pub fn validate_relative_path(path: &str) -> Result<(), ApiError> {
    if path.starts_with('/') || path.contains('\0') {
        return Err(ApiError::bad_request("Path must be relative"));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(ApiError::bad_request("Path cannot leave the stack directory"));
    }
    Ok(())
}
