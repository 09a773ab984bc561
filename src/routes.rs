//! Front-door paths.
//!
//! The HTTP layer is a collaborator: it only needs to know which paths exist
//! and which side operation each one maps to. [`ActRoutes`] derives the paths
//! of one act from its id (`_` becomes `-`); [`agent_endpoints`] lists the
//! agent-wide paths (about and context access). An [`EndpointRegistrar`]
//! receives one [`Endpoint`] per path from
//! [`FacadeSide::register_endpoints`](crate::sides::FacadeSide::register_endpoints).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{ActionId, TaskUid};

/// Placeholder used in path templates for the task uid.
pub const UID_PLACEHOLDER: &str = "{uid_task}";

/// Placeholder used in path templates for a context key.
pub const HID_PLACEHOLDER: &str = "{hid}";

/// Agent description.
pub const ABOUT_PATH: &str = "/";
/// The whole current context.
pub const GET_CONTEXT_PATH: &str = "/get-context";
/// One context value, followed by `/{hid}`.
pub const GET_CONTEXT_VALUE_PATH: &str = "/get-context-value";
/// Sets one context value.
pub const SET_CONTEXT_VALUE_PATH: &str = "/set-context-value";

/// What an endpoint does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    /// Describe the agent and its acts.
    About,
    /// Read the current context.
    GetContext,
    /// Read one value of the current context.
    GetContextValue,
    /// Set one value of the current context.
    SetContextValue,
    /// Publish a task built from the current context; answers with the uid.
    Invoke,
    /// Ask the persistence side for stored progress.
    RequestProgress,
    /// Read cached progress.
    ResponseProgress,
    /// Ask the persistence side for a stored result.
    RequestResult,
    /// Read a cached result.
    ResponseResult,
}

impl EndpointKind {
    /// Agent-wide kinds, in registration order.
    pub const AGENT: [EndpointKind; 4] = [
        EndpointKind::About,
        EndpointKind::GetContext,
        EndpointKind::GetContextValue,
        EndpointKind::SetContextValue,
    ];

    /// Per-act kinds, in registration order.
    pub const ACT: [EndpointKind; 5] = [
        EndpointKind::Invoke,
        EndpointKind::RequestProgress,
        EndpointKind::ResponseProgress,
        EndpointKind::RequestResult,
        EndpointKind::ResponseResult,
    ];

    /// Path segment after the act, if any.
    fn segment(&self) -> Option<&'static str> {
        match self {
            Self::RequestProgress => Some("request-progress"),
            Self::ResponseProgress => Some("response-progress"),
            Self::RequestResult => Some("request-result"),
            Self::ResponseResult => Some("response-result"),
            Self::Invoke
            | Self::About
            | Self::GetContext
            | Self::GetContextValue
            | Self::SetContextValue => None,
        }
    }

    /// Whether the path carries a task uid.
    pub fn takes_uid(&self) -> bool {
        self.segment().is_some()
    }

    /// Whether the endpoint belongs to the agent rather than one act.
    pub fn is_agent_level(&self) -> bool {
        Self::AGENT.contains(self)
    }
}

/// A path the front door should serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Operation behind the path.
    pub kind: EndpointKind,
    /// Act the path belongs to; `None` for agent-wide paths.
    pub action_id: Option<ActionId>,
    /// Path template; uid-taking paths end in [`UID_PLACEHOLDER`].
    pub path: String,
}

/// Receiver of endpoint declarations, implemented by the HTTP layer.
pub trait EndpointRegistrar {
    /// Registers one endpoint.
    fn register(&mut self, endpoint: Endpoint);
}

impl EndpointRegistrar for Vec<Endpoint> {
    fn register(&mut self, endpoint: Endpoint) {
        self.push(endpoint);
    }
}

/// Description served at [`ABOUT_PATH`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct About {
    /// Human-readable agent name.
    pub name: String,
    /// Agent id.
    pub hid: String,
    /// Role serving the description.
    pub sidename: String,
    /// Agent version.
    pub version: String,
    /// One-line description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    /// Exposed acts.
    #[serde(default)]
    pub acts: Vec<ActAbout>,
}

/// One act as listed in [`About`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActAbout {
    /// Action id.
    pub hid: ActionId,
    /// Invoke path.
    pub path: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// One-line description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    /// Longer description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Free-form tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Act version.
    pub version: String,
}

impl ActAbout {
    /// An entry with only the id and path filled in.
    pub fn bare(hid: ActionId) -> Self {
        let path = ActRoutes::new(hid.clone()).invoke();
        Self {
            hid,
            path,
            name: String::new(),
            summary: String::new(),
            description: String::new(),
            tags: Vec::new(),
            version: String::new(),
        }
    }
}

/// The agent-wide endpoints.
pub fn agent_endpoints() -> Vec<Endpoint> {
    EndpointKind::AGENT
        .into_iter()
        .map(|kind| Endpoint {
            kind,
            action_id: None,
            path: match kind {
                EndpointKind::GetContext => GET_CONTEXT_PATH.to_string(),
                EndpointKind::GetContextValue => {
                    format!("{GET_CONTEXT_VALUE_PATH}/{HID_PLACEHOLDER}")
                },
                EndpointKind::SetContextValue => SET_CONTEXT_VALUE_PATH.to_string(),
                _ => ABOUT_PATH.to_string(),
            },
        })
        .collect()
}

/// Matches a concrete path against the agent-wide paths.
///
/// Returns the endpoint kind and, for [`EndpointKind::GetContextValue`], the
/// context key.
pub fn resolve_agent(path: &str) -> Option<(EndpointKind, Option<String>)> {
    match path {
        ABOUT_PATH | "" => Some((EndpointKind::About, None)),
        GET_CONTEXT_PATH => Some((EndpointKind::GetContext, None)),
        SET_CONTEXT_VALUE_PATH => Some((EndpointKind::SetContextValue, None)),
        _ => {
            let hid = path
                .strip_prefix(GET_CONTEXT_VALUE_PATH)?
                .strip_prefix('/')?;
            (!hid.is_empty() && !hid.contains('/'))
                .then(|| (EndpointKind::GetContextValue, Some(hid.to_string())))
        },
    }
}

/// Fails if two acts share a path, or an act's path is an agent-wide one.
///
/// `a_b` and `a-b` are distinct ids but both live under `/a-b`.
///
/// # Errors
///
/// [`Error::Configuration`] naming the clashing acts.
pub fn check_paths(acts: &[ActionId]) -> Result<()> {
    let reserved = [GET_CONTEXT_PATH, GET_CONTEXT_VALUE_PATH, SET_CONTEXT_VALUE_PATH];
    let mut seen: HashMap<String, &ActionId> = HashMap::new();
    for act in acts {
        let path = ActRoutes::new(act.clone()).invoke();
        if reserved.contains(&path.as_str()) {
            return Err(Error::configuration(format!(
                "act '{act}' would be served at reserved path {path}"
            )));
        }
        if let Some(other) = seen.insert(path.clone(), act) {
            if other != act {
                return Err(Error::configuration(format!(
                    "acts '{other}' and '{act}' are both served at {path}"
                )));
            }
        }
    }
    Ok(())
}

/// Paths of one act.
///
/// # Examples
///
/// ```
/// use aide::routes::ActRoutes;
/// use aide::{ActionId, TaskUid};
///
/// let routes = ActRoutes::new(ActionId::new("products_today").unwrap());
/// assert_eq!(routes.invoke(), "/products-today");
/// assert_eq!(
///     routes.response_result(&TaskUid::from("42")),
///     "/products-today/response-result/42"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActRoutes {
    action_id: ActionId,
    base: String,
}

impl ActRoutes {
    /// Derives the paths for `action_id`.
    pub fn new(action_id: ActionId) -> Self {
        let base = format!("/{}", action_id.as_str().replace('_', "-"));
        Self { action_id, base }
    }

    /// The act these paths belong to.
    pub fn action_id(&self) -> &ActionId {
        &self.action_id
    }

    /// `/{act}`
    pub fn invoke(&self) -> String {
        self.base.clone()
    }

    /// `/{act}/request-progress/{uid}`
    pub fn request_progress(&self, uid: &TaskUid) -> String {
        self.path(EndpointKind::RequestProgress, uid.as_str())
    }

    /// `/{act}/response-progress/{uid}`
    pub fn response_progress(&self, uid: &TaskUid) -> String {
        self.path(EndpointKind::ResponseProgress, uid.as_str())
    }

    /// `/{act}/request-result/{uid}`
    pub fn request_result(&self, uid: &TaskUid) -> String {
        self.path(EndpointKind::RequestResult, uid.as_str())
    }

    /// `/{act}/response-result/{uid}`
    pub fn response_result(&self, uid: &TaskUid) -> String {
        self.path(EndpointKind::ResponseResult, uid.as_str())
    }

    /// The path template for `kind`.
    pub fn template(&self, kind: EndpointKind) -> String {
        self.path(kind, UID_PLACEHOLDER)
    }

    /// One endpoint per act-level kind.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        EndpointKind::ACT
            .into_iter()
            .map(|kind| Endpoint {
                kind,
                action_id: Some(self.action_id.clone()),
                path: self.template(kind),
            })
            .collect()
    }

    /// Matches a concrete path against this act's paths.
    ///
    /// Returns the endpoint kind and, for uid-taking paths, the uid.
    pub fn resolve(&self, path: &str) -> Option<(EndpointKind, Option<TaskUid>)> {
        let rest = path.strip_prefix(&self.base)?;
        if rest.is_empty() || rest == "/" {
            return Some((EndpointKind::Invoke, None));
        }
        let rest = rest.strip_prefix('/')?;
        let (segment, uid) = rest.split_once('/')?;
        if uid.is_empty() || uid.contains('/') {
            return None;
        }
        EndpointKind::ACT
            .into_iter()
            .find(|kind| kind.segment() == Some(segment))
            .map(|kind| (kind, Some(TaskUid::from(uid))))
    }

    fn path(&self, kind: EndpointKind, uid: &str) -> String {
        match kind.segment() {
            Some(segment) => format!("{}/{segment}/{uid}", self.base),
            None => self.base.clone(),
        }
    }
}

impl fmt::Display for ActRoutes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn routes() -> ActRoutes {
        ActRoutes::new(ActionId::new("products_today").unwrap())
    }

    #[test]
    fn templates_replace_underscores() {
        let paths: Vec<String> = routes().endpoints().into_iter().map(|e| e.path).collect();
        assert_eq!(
            paths,
            vec![
                "/products-today",
                "/products-today/request-progress/{uid_task}",
                "/products-today/response-progress/{uid_task}",
                "/products-today/request-result/{uid_task}",
                "/products-today/response-result/{uid_task}",
            ]
        );
    }

    #[test]
    fn resolve_round_trips_concrete_paths() {
        let routes = routes();
        let uid = TaskUid::from("abc-1");
        assert_eq!(
            routes.resolve(&routes.request_progress(&uid)),
            Some((EndpointKind::RequestProgress, Some(uid.clone())))
        );
        assert_eq!(
            routes.resolve("/products-today"),
            Some((EndpointKind::Invoke, None))
        );
        assert_eq!(routes.resolve("/products-today/unknown/abc"), None);
        assert_eq!(routes.resolve("/products-today-v2"), None);
        assert_eq!(routes.resolve("/other/request-result/abc"), None);
    }

    #[test]
    fn agent_paths_resolve_to_their_kinds() {
        let paths: Vec<String> = agent_endpoints().into_iter().map(|e| e.path).collect();
        assert_eq!(
            paths,
            vec!["/", "/get-context", "/get-context-value/{hid}", "/set-context-value"]
        );
        assert_eq!(resolve_agent("/"), Some((EndpointKind::About, None)));
        assert_eq!(
            resolve_agent("/get-context-value/q"),
            Some((EndpointKind::GetContextValue, Some("q".to_string())))
        );
        assert_eq!(resolve_agent("/get-context-value/"), None);
        assert_eq!(resolve_agent("/echo"), None);
        assert!(EndpointKind::AGENT.iter().all(EndpointKind::is_agent_level));
        assert!(!EndpointKind::Invoke.is_agent_level());
    }

    #[test]
    fn acts_sharing_a_path_are_rejected() {
        let ids = |names: &[&str]| -> Vec<ActionId> {
            names.iter().map(|n| ActionId::new(*n).unwrap()).collect()
        };
        assert!(check_paths(&ids(&["products_today", "echo"])).is_ok());
        assert!(matches!(
            check_paths(&ids(&["a_b", "a-b"])),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            check_paths(&ids(&["get_context"])),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn vec_collects_registrations() {
        let mut registrar: Vec<Endpoint> = Vec::new();
        for endpoint in routes().endpoints() {
            registrar.register(endpoint);
        }
        assert_eq!(registrar.len(), 5);
        assert!(registrar
            .iter()
            .all(|e| e.kind.takes_uid() == e.path.ends_with(UID_PLACEHOLDER)));
    }
}
