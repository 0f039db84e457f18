//! Inbound WebSocket message shapes.

use serde::{Deserialize, Deserializer};

use cloudrepl_core::policy::validate_owner_id;
use cloudrepl_core::{Error, OwnerId, Result};

/// A decoded client message.
///
/// Every field except `type` is optional at the wire level; handlers
/// require the ones they need through the accessor methods.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(rename = "userId", default, deserialize_with = "lenient_string")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub new_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_u16")]
    pub rows: Option<u16>,
    #[serde(default, deserialize_with = "lenient_u16")]
    pub cols: Option<u16>,
    #[serde(default)]
    pub data: Option<String>,
}

impl InboundMessage {
    pub fn message_kind(&self) -> MessageKind {
        MessageKind::parse(&self.kind)
    }

    /// The addressed owner, validated for use as a path component.
    pub fn owner(&self) -> Result<OwnerId> {
        let owner = OwnerId::new(self.required("userId", &self.user_id)?);
        validate_owner_id(&owner)?;
        Ok(owner)
    }

    pub fn path(&self) -> Result<&str> {
        self.required("path", &self.path)
    }

    /// Directory to list; the working directory when absent.
    pub fn path_or_root(&self) -> &str {
        self.path.as_deref().filter(|p| !p.is_empty()).unwrap_or(".")
    }

    pub fn search(&self) -> Result<&str> {
        self.required("search", &self.search)
    }

    pub fn new_name(&self) -> Result<&str> {
        self.required("new_name", &self.new_name)
    }

    pub fn data(&self) -> Result<&str> {
        self.data
            .as_deref()
            .ok_or_else(|| Error::invalid_request("missing field 'data'"))
    }

    pub fn dimensions(&self) -> Result<(u16, u16)> {
        match (self.rows, self.cols) {
            (Some(rows), Some(cols)) if rows > 0 && cols > 0 => Ok((rows, cols)),
            _ => Err(Error::invalid_request(
                "resize needs positive 'rows' and 'cols'",
            )),
        }
    }

    fn required<'a>(&self, name: &str, value: &'a Option<String>) -> Result<&'a str> {
        match value.as_deref() {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(Error::invalid_request(format!("missing field '{}'", name))),
        }
    }
}

/// Message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    InitProject,
    WriteFile,
    ReadFile,
    ListFiles,
    RemoveFile,
    StatFile,
    SearchFile,
    RenameFile,
    CreateDir,
    ResizeTerminal,
    StartTerminal,
    Input,
    StopTerminal,
    Unknown,
}

impl MessageKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "init_project" => Self::InitProject,
            "write_file" => Self::WriteFile,
            "read_file" => Self::ReadFile,
            "list_files" => Self::ListFiles,
            "remove_file" => Self::RemoveFile,
            "stat_file" => Self::StatFile,
            "search_file" => Self::SearchFile,
            "rename_file" => Self::RenameFile,
            "create_dir" => Self::CreateDir,
            "resize_terminal" => Self::ResizeTerminal,
            "start_terminal" => Self::StartTerminal,
            "input" => Self::Input,
            "stop_terminal" => Self::StopTerminal,
            _ => Self::Unknown,
        }
    }

    /// Metric label for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitProject => "init_project",
            Self::WriteFile => "write_file",
            Self::ReadFile => "read_file",
            Self::ListFiles => "list_files",
            Self::RemoveFile => "remove_file",
            Self::StatFile => "stat_file",
            Self::SearchFile => "search_file",
            Self::RenameFile => "rename_file",
            Self::CreateDir => "create_dir",
            Self::ResizeTerminal => "resize_terminal",
            Self::StartTerminal => "start_terminal",
            Self::Input => "input",
            Self::StopTerminal => "stop_terminal",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Text(String),
}

fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<NumberOrString>::deserialize(deserializer)?.map(|value| match value {
            NumberOrString::Number(n) => n.to_string(),
            NumberOrString::Text(s) => s,
        }),
    )
}

fn lenient_u16<'de, D>(deserializer: D) -> std::result::Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => u16::try_from(n)
            .map(Some)
            .map_err(|_| D::Error::custom(format!("{} is out of range", n))),
        Some(NumberOrString::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(NumberOrString::Text(s)) => s
            .trim()
            .parse::<u16>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("'{}' is not a number", s))),
    }
}
