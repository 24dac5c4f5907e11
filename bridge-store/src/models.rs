use bridge_channels::{MessageType, PlatformType, StoredFile};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upper-case status enums persisted as TEXT.
macro_rules! sql_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "UPPERCASE")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($name), ": {:?}"), other)),
                }
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let raw = value.as_str()?;
                raw.parse().map_err(|error: String| FromSqlError::Other(error.into()))
            }
        }
    };
}

sql_enum!(BindingStatus {
    Pending => "PENDING",
    Active => "ACTIVE",
    Revoked => "REVOKED",
});

sql_enum!(MessageDirection {
    Inbound => "INBOUND",
    Outbound => "OUTBOUND",
});

sql_enum!(
    /// Lifecycle of one logged message: RECEIVED, then COMPLETED/FAILED directly or via
    /// PENDING and PROCESSING.
    ProcessingStatus {
        Received => "RECEIVED",
        Pending => "PENDING",
        Processing => "PROCESSING",
        Completed => "COMPLETED",
        Failed => "FAILED",
    }
);

sql_enum!(TaskStatus {
    Pending => "PENDING",
    Running => "RUNNING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

impl ProcessingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Employee {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub department: Option<String>,
    pub position: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewEmployee {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub id: i64,
    pub employee_id: i64,
    pub platform_type: PlatformType,
    pub platform_user_id: Option<String>,
    pub platform_username: Option<String>,
    pub binding_code: Option<String>,
    pub code_expires_at: Option<DateTime<Utc>>,
    pub status: BindingStatus,
    pub bound_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Identity of the platform user redeeming a bind code.
#[derive(Debug, Clone)]
pub struct PlatformIdentity {
    pub platform_type: PlatformType,
    pub platform_user_id: String,
    pub platform_username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLog {
    pub id: i64,
    pub binding_id: Option<i64>,
    pub platform_type: PlatformType,
    pub platform_user_id: String,
    pub platform_message_id: Option<String>,
    pub direction: MessageDirection,
    pub content: String,
    pub message_type: MessageType,
    pub file_path: Option<String>,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub processing_status: ProcessingStatus,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessageLog {
    pub binding_id: Option<i64>,
    pub platform_type: PlatformType,
    pub platform_user_id: String,
    pub platform_message_id: Option<String>,
    pub direction: MessageDirection,
    pub content: String,
    pub message_type: MessageType,
    pub file: Option<StoredFile>,
    pub processing_status: ProcessingStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewMessageLog {
    pub fn outbound(
        binding_id: Option<i64>,
        platform_type: PlatformType,
        platform_user_id: impl Into<String>,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            binding_id,
            platform_type,
            platform_user_id: platform_user_id.into(),
            platform_message_id: None,
            direction: MessageDirection::Outbound,
            content: content.into(),
            message_type: MessageType::Text,
            file: None,
            processing_status: ProcessingStatus::Completed,
            error_message: None,
            created_at,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub platform_type: Option<PlatformType>,
    pub status: Option<ProcessingStatus>,
    pub direction: Option<MessageDirection>,
    pub binding_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub size: u32,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncTask {
    pub id: i64,
    pub binding_id: i64,
    pub task_type: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub input_data: serde_json::Value,
    pub output_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub binding_id: i64,
    pub task_type: String,
    pub priority: i64,
    pub input_data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub id: i64,
    pub platform_type: PlatformType,
    pub platform_name: String,
    pub config_data: serde_json::Map<String, serde_json::Value>,
    pub webhook_url: Option<String>,
    pub is_enabled: bool,
    pub updated_at: DateTime<Utc>,
}

impl PlatformConfig {
    /// A non-empty string value from `config_data`.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config_data
            .get(key)
            .and_then(serde_json::Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformConfigUpdate {
    #[serde(default)]
    pub platform_name: Option<String>,
    #[serde(default)]
    pub config_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub is_enabled: bool,
}
