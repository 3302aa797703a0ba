use std::io;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// A user entity as stored by the DB worker and rendered over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub age: u32,
    pub hobbies: Vec<String>,
}

/// The mutable fields of a [`User`], as accepted by create and update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserFields {
    pub username: String,
    pub age: u32,
    pub hobbies: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Db,
    Balancer,
    Regular,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Db => "db",
            Role::Balancer => "balancer",
            Role::Regular => "regular",
        }
    }
}

/// One entry in the primary's worker registry. `id` is the worker's OS pid;
/// `port` is set only for workers that bind an HTTP listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerRecord {
    pub id: u32,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// The closed command set exchanged between workers and the primary.
///
/// Every read/mutate command has a paired `...Request` / `...Response` name,
/// and the serialized form is `{"cmd": <name>, "data": {...}}` so handling
/// code matches exhaustively instead of probing loose fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "cmd", content = "data", rename_all = "camelCase")]
pub enum Command {
    WorkersRequest,
    WorkersResponse {
        workers: Vec<WorkerRecord>,
    },
    GetAllUsersRequest,
    GetAllUsersResponse {
        users: Vec<User>,
    },
    GetOneUserRequest {
        id: Uuid,
    },
    GetOneUserResponse {
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<User>,
    },
    CreateUserRequest {
        body: UserFields,
    },
    CreateUserResponse {
        user: User,
    },
    UpdateUserRequest {
        id: Uuid,
        body: UserFields,
    },
    UpdateUserResponse {
        #[serde(skip_serializing_if = "Option::is_none")]
        user: Option<User>,
    },
    DeleteUserRequest {
        id: Uuid,
    },
    DeleteUserResponse {
        ok: bool,
    },
}

impl Command {
    /// CRUD requests are the commands the primary forwards to the DB worker.
    pub fn is_crud_request(&self) -> bool {
        matches!(
            self,
            Command::GetAllUsersRequest
                | Command::GetOneUserRequest { .. }
                | Command::CreateUserRequest { .. }
                | Command::UpdateUserRequest { .. }
                | Command::DeleteUserRequest { .. }
        )
    }

    /// CRUD responses travel the other way, back to the request worker
    /// named by the envelope's `workerID`.
    pub fn is_crud_response(&self) -> bool {
        matches!(
            self,
            Command::GetAllUsersResponse { .. }
                | Command::GetOneUserResponse { .. }
                | Command::CreateUserResponse { .. }
                | Command::UpdateUserResponse { .. }
                | Command::DeleteUserResponse { .. }
        )
    }
}

/// The envelope carried on every control-channel exchange.
///
/// `workerID` is stamped by the primary when forwarding a request to the DB
/// worker and echoed back unchanged in the response so the primary can route
/// it home. `correlationId` is generated by a request worker per outbound
/// request and echoed back so the worker can match the reply to the right
/// suspended HTTP connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    #[serde(flatten)]
    pub command: Command,
    #[serde(rename = "workerID", default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<u32>,
    #[serde(rename = "correlationId", default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    /// An envelope with no routing metadata attached yet.
    pub fn bare(command: Command) -> Self {
        Self {
            command,
            worker_id: None,
            correlation_id: None,
        }
    }
}

/// First frame a worker sends after connecting to the control socket,
/// binding the connection to the registry entry created at fork time.
/// Node's `cluster` module provides this identity implicitly; over TCP it
/// has to be explicit. Not part of the routed command set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hello {
    pub id: u32,
}

pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    // Line-oriented JSON framing; blank lines are skipped.
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.is_empty() {
            continue;
        }

        let parsed = serde_json::from_str(trimmed).map_err(to_io_error)?;
        return Ok(Some(parsed));
    }
}

pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).map_err(to_io_error)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_user() -> User {
        User {
            id: Uuid::new_v4(),
            username: "Leo".into(),
            age: 30,
            hobbies: vec!["js".into()],
        }
    }

    #[test]
    fn request_wire_shape_matches_cmd_data_convention() {
        let user = sample_user();
        let envelope = Envelope {
            command: Command::GetOneUserRequest { id: user.id },
            worker_id: Some(42),
            correlation_id: Some("abc123".into()),
        };

        let encoded = serde_json::to_value(&envelope).expect("serialize envelope");
        assert_eq!(
            encoded,
            json!({
                "cmd": "getOneUserRequest",
                "data": { "id": user.id },
                "workerID": 42,
                "correlationId": "abc123",
            })
        );
    }

    #[test]
    fn bare_request_omits_routing_metadata() {
        let encoded =
            serde_json::to_value(Envelope::bare(Command::WorkersRequest)).expect("serialize");
        assert_eq!(encoded, json!({ "cmd": "workersRequest" }));
    }

    #[test]
    fn absent_user_is_omitted_not_null() {
        let envelope = Envelope::bare(Command::GetOneUserResponse { user: None });
        let encoded = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(encoded, json!({ "cmd": "getOneUserResponse", "data": {} }));

        let decoded: Envelope =
            serde_json::from_str(&encoded.to_string()).expect("parse back");
        assert_eq!(decoded.command, Command::GetOneUserResponse { user: None });
    }

    #[test]
    fn unknown_cmd_is_a_parse_error() {
        let raw = r#"{"cmd":"formatDiskRequest","data":{}}"#;
        assert!(serde_json::from_str::<Envelope>(raw).is_err());
    }

    #[tokio::test]
    async fn roundtrip_envelope_over_a_stream() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);
        let envelope = Envelope {
            command: Command::CreateUserResponse { user: sample_user() },
            worker_id: Some(7),
            correlation_id: Some("xyz".into()),
        };

        write_message(&mut writer, &envelope).await.expect("write");
        let parsed = read_message::<_, Envelope>(&mut reader)
            .await
            .expect("read")
            .expect("expected a frame");

        assert_eq!(envelope, parsed);
    }

    #[tokio::test]
    async fn malformed_line_does_not_poison_the_stream() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let mut reader = tokio::io::BufReader::new(reader);

        writer.write_all(b"not json at all\n").await.expect("write");
        write_message(&mut writer, &Envelope::bare(Command::WorkersRequest))
            .await
            .expect("write frame");

        let first = read_message::<_, Envelope>(&mut reader).await;
        assert!(first.is_err());

        let second = read_message::<_, Envelope>(&mut reader)
            .await
            .expect("read after bad line")
            .expect("expected a frame");
        assert_eq!(second.command, Command::WorkersRequest);
    }
}
