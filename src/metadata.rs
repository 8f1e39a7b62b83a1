use std::net::SocketAddr;

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tonic::metadata::MetadataMap;

use crate::config::ParamKind;
use crate::proxy::MeshError;
use crate::registry::DynMessage;

/// The parsed request line: verb, service, method and any values bound out of
/// the path itself.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Uri {
	pub http_verb: String,
	pub service_name: String,
	pub method: String,
	#[serde(skip_serializing_if = "Map::is_empty")]
	pub params: Map<String, Value>,
}

/// Per-method metadata: the URI parts plus the backend method's schema names
/// and (for direct routing) its own host.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
	#[serde(flatten)]
	pub uri: Uri,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub host: String,
	pub request_message: String,
	pub response_message: String,
}

impl Descriptor {
	/// The canonical call path, `/service/method`.
	pub fn full_method(&self) -> String {
		format!("/{}/{}", self.uri.service_name, self.uri.method)
	}

	/// Route table key: the call path, case-folded.
	pub fn route_key(&self) -> String {
		self.full_method().to_lowercase()
	}
}

/// In-band error envelope; serialised as `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
	pub error: String,
}

pub enum CallResult {
	Message(Box<dyn DynMessage>),
	Error(ErrorBody),
}

impl CallResult {
	pub fn to_json(&self) -> Result<Value, MeshError> {
		match self {
			CallResult::Message(m) => m.to_json(),
			CallResult::Error(e) => Ok(serde_json::json!({ "error": e.error })),
		}
	}

	pub fn error(&self) -> Option<&str> {
		match self {
			CallResult::Error(e) => Some(&e.error),
			CallResult::Message(_) => None,
		}
	}
}

/// Per-request state threaded through the middleware chain. Owned by the
/// ingress task until the response is written.
#[derive(Default)]
pub struct MetaData {
	pub descriptor: Descriptor,
	/// Selected backend address; set by route matching.
	pub target: String,
	/// Merged query/form/body payload (HTTP ingress only).
	pub payload: Map<String, Value>,
	pub result: Option<CallResult>,
	pub peer: Option<SocketAddr>,
	/// Incoming request headers.
	pub headers: HeaderMap,
	/// Reply metadata captured from the backend (HTTP ingress only).
	pub reply_metadata: Option<MetadataMap>,
}

impl MetaData {
	pub fn set_error(&mut self, msg: impl Into<String>) {
		self.result = Some(CallResult::Error(ErrorBody { error: msg.into() }));
	}

	pub fn error(&self) -> Option<&str> {
		self.result.as_ref().and_then(|r| r.error())
	}
}

/// Default grammar: `/{service-with-dashes}/{method}`. Dashes in the service
/// segment stand in for dots, so `greet-v1-Greeter` names `greet.v1.Greeter`.
pub fn parse_default_path(path: &str) -> Result<Uri, MeshError> {
	let trimmed = path.trim_start_matches('/');
	let mut parts = trimmed.split('/');
	match (parts.next(), parts.next(), parts.next()) {
		(Some(service), Some(method), None) if !service.is_empty() && !method.is_empty() => Ok(Uri {
			service_name: service.replace('-', "."),
			method: method.to_string(),
			..Default::default()
		}),
		_ => Err(MeshError::MalformedPath(path.to_string())),
	}
}

/// Param grammar: `/{pkg}-{svc}-{method}[/{value}]`, binding the optional
/// trailing value under `key` with the configured type.
pub fn parse_param_path(path: &str, key: &str, kind: ParamKind) -> Result<Uri, MeshError> {
	let malformed = || MeshError::MalformedPath(path.to_string());
	let trimmed = path.trim_start_matches('/');
	let mut segments = trimmed.split('/');
	let head = segments.next().ok_or_else(malformed)?;
	let value = segments.next();
	if segments.next().is_some() {
		return Err(malformed());
	}
	let names: Vec<&str> = head.split('-').collect();
	let [pkg, svc, method] = names.as_slice() else {
		return Err(malformed());
	};
	if pkg.is_empty() || svc.is_empty() || method.is_empty() {
		return Err(malformed());
	}

	let mut params = Map::new();
	if let Some(value) = value.filter(|v| !v.is_empty()) {
		let parsed = match kind {
			ParamKind::String => Value::String(value.to_string()),
			ParamKind::Int => Value::from(value.parse::<i64>().map_err(|_| malformed())?),
			ParamKind::Float => Value::from(value.parse::<f64>().map_err(|_| malformed())?),
		};
		params.insert(key.to_string(), parsed);
	}

	Ok(Uri {
		service_name: format!("{pkg}.{svc}"),
		method: method.to_string(),
		params,
		..Default::default()
	})
}

/// Merges the request payload: query and form pairs first, JSON body fields
/// over them, and finally any values bound out of the path. A pair whose
/// value is itself a JSON object is unpacked and its fields promoted.
pub fn assemble_payload(
	query: Option<&str>,
	form: Option<&[u8]>,
	json_body: Option<&[u8]>,
	path_params: &Map<String, Value>,
) -> Result<Map<String, Value>, MeshError> {
	let mut merged = Map::new();

	if let Some(query) = query {
		for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
			promote(&mut merged, &k, &v);
		}
	}
	if let Some(form) = form {
		for (k, v) in url::form_urlencoded::parse(form) {
			promote(&mut merged, &k, &v);
		}
	}

	if let Some(body) = json_body.filter(|b| !b.is_empty()) {
		let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(body) else {
			return Err(MeshError::MalformedPayload);
		};
		for (k, v) in fields {
			merged.insert(k, v);
		}
	}

	for (k, v) in path_params {
		merged.insert(k.clone(), v.clone());
	}

	Ok(merged)
}

fn promote(into: &mut Map<String, Value>, key: &str, value: &str) {
	if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(value) {
		into.extend(fields);
		return;
	}
	// A bare JSON object posted as form data lands entirely in the key.
	if value.is_empty() {
		if let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(key) {
			into.extend(fields);
			return;
		}
	}
	into.insert(key.to_string(), Value::String(value.to_string()));
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_path_maps_dashes_to_dots() {
		let uri = parse_default_path("/greet-v1-Greeter/SayHello").unwrap();
		assert_eq!(uri.service_name, "greet.v1.Greeter");
		assert_eq!(uri.method, "SayHello");

		let uri = parse_default_path("/a-b/m").unwrap();
		assert_eq!(uri.service_name, "a.b");
		assert_eq!(uri.method, "m");
	}

	#[test]
	fn default_path_rejects_bad_shapes() {
		assert!(parse_default_path("/only-one-segment").is_err());
		assert!(parse_default_path("/a/b/c").is_err());
		assert!(parse_default_path("//m").is_err());
	}

	#[test]
	fn param_path_binds_typed_value() {
		let uri = parse_param_path("/greet-v1-SayHello/42", "id", ParamKind::Int).unwrap();
		assert_eq!(uri.service_name, "greet.v1");
		assert_eq!(uri.method, "SayHello");
		assert_eq!(uri.params.get("id"), Some(&Value::from(42)));

		assert!(parse_param_path("/greet-v1-SayHello/abc", "id", ParamKind::Int).is_err());
		assert!(parse_param_path("/greet-v1/x", "id", ParamKind::String).is_err());
	}

	#[test]
	fn payload_precedence_body_over_form_params_over_all() {
		let mut params = Map::new();
		params.insert("name".into(), Value::String("from-path".into()));

		let merged = assemble_payload(
			Some("name=from-query&extra=1"),
			None,
			Some(br#"{"name":"from-body","other":2}"#),
			&params,
		)
		.unwrap();
		assert_eq!(merged.get("name"), Some(&Value::String("from-path".into())));
		assert_eq!(merged.get("other"), Some(&Value::from(2)));
		assert_eq!(merged.get("extra"), Some(&Value::String("1".into())));

		let merged = assemble_payload(
			Some("name=from-query"),
			None,
			Some(br#"{"name":"from-body"}"#),
			&Map::new(),
		)
		.unwrap();
		assert_eq!(merged.get("name"), Some(&Value::String("from-body".into())));
	}

	#[test]
	fn object_values_are_promoted() {
		let merged = assemble_payload(Some(r#"a=%7B%22x%22%3A1%7D"#), None, None, &Map::new()).unwrap();
		assert_eq!(merged.get("x"), Some(&Value::from(1)));
		assert!(!merged.contains_key("a"));
	}

	#[test]
	fn malformed_body_is_rejected() {
		assert!(matches!(
			assemble_payload(None, None, Some(b"not json"), &Map::new()),
			Err(MeshError::MalformedPayload)
		));
	}
}
