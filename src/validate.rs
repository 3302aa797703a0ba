//! Request validation performed by request workers before any IPC round
//! trip. Failures here are answered with a 400 locally and never reach the
//! DB worker.

use serde_json::Value;
use uuid::Uuid;

use crate::message::UserFields;

pub const ID_REQUIRED: &str = "ID is required";
pub const ID_INVALID: &str = "ID is invalid";
pub const JSON_INVALID: &str = "JSON is invalid";

/// Checks that a path segment is a well-formed UUID.
pub fn validate_id(raw: &str) -> Result<Uuid, String> {
    if raw.is_empty() {
        return Err(ID_REQUIRED.into());
    }
    Uuid::parse_str(raw).map_err(|_| ID_INVALID.into())
}

/// Checks a decoded JSON body against the user schema and returns the
/// normalized fields. All field errors are collected and joined so the
/// client sees every problem at once.
pub fn validate_body(body: &Value) -> Result<UserFields, String> {
    let Some(object) = body.as_object() else {
        return Err("Body must be an object".into());
    };

    let mut errors = Vec::new();

    let username = match object.get("username").and_then(Value::as_str) {
        Some(name) if !name.is_empty() => Some(name.to_string()),
        _ => {
            errors.push("Username is required");
            None
        }
    };

    let age = match object.get("age") {
        None | Some(Value::Null) => {
            errors.push("Age is required");
            None
        }
        Some(value) => match value.as_u64().and_then(|age| u32::try_from(age).ok()) {
            Some(age) => Some(age),
            None => {
                errors.push("Age must be a number");
                None
            }
        },
    };

    let hobbies = match object.get("hobbies") {
        None | Some(Value::Null) => {
            errors.push("Hobbies are required");
            None
        }
        Some(Value::Array(items)) => {
            let strings: Option<Vec<String>> = items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect();
            if strings.is_none() {
                errors.push("Hobbies must be an array of strings");
            }
            strings
        }
        Some(_) => {
            errors.push("Hobbies must be an array of strings");
            None
        }
    };

    match (username, age, hobbies) {
        (Some(username), Some(age), Some(hobbies)) => Ok(UserFields {
            username,
            age,
            hobbies,
        }),
        _ => Err(errors.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn well_formed_uuid_passes() {
        let id = Uuid::new_v4();
        assert_eq!(validate_id(&id.to_string()), Ok(id));
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert_eq!(validate_id(""), Err(ID_REQUIRED.into()));
        assert_eq!(validate_id("not-a-uuid"), Err(ID_INVALID.into()));
        assert_eq!(validate_id("1234"), Err(ID_INVALID.into()));
    }

    #[test]
    fn complete_body_is_normalized() {
        let body = json!({ "username": "Leo", "age": 30, "hobbies": ["js"] });
        let fields = validate_body(&body).expect("valid body");
        assert_eq!(fields.username, "Leo");
        assert_eq!(fields.age, 30);
        assert_eq!(fields.hobbies, vec!["js".to_string()]);
    }

    #[test]
    fn missing_fields_are_all_reported() {
        let err = validate_body(&json!({})).expect_err("empty body");
        assert!(err.contains("Username is required"));
        assert!(err.contains("Age is required"));
        assert!(err.contains("Hobbies are required"));
    }

    #[test]
    fn wrong_types_are_rejected() {
        let err = validate_body(&json!({ "username": "Leo", "age": "thirty", "hobbies": ["js"] }))
            .expect_err("age must be numeric");
        assert_eq!(err, "Age must be a number");

        let err = validate_body(&json!({ "username": "Leo", "age": 30, "hobbies": [1, 2] }))
            .expect_err("hobbies must be strings");
        assert_eq!(err, "Hobbies must be an array of strings");

        let err = validate_body(&json!({ "username": "Leo", "age": 30, "hobbies": "js" }))
            .expect_err("hobbies must be an array");
        assert_eq!(err, "Hobbies must be an array of strings");
    }

    #[test]
    fn non_object_body_is_rejected() {
        assert!(validate_body(&json!([1, 2, 3])).is_err());
        assert!(validate_body(&json!("hello")).is_err());
    }
}
