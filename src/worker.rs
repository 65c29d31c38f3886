//! Worker-side request execution.
//!
//! A [`Job`] arrives with exclusive ownership of the client socket. The
//! worker resolves the template, extracts the request parameters, runs
//! the template inside a fresh sandbox, and guarantees that exactly one
//! response is flushed before the socket closes.

use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use molt::types::Value;

use crate::cgi;
use crate::cgi::multipart::Multipart;
use crate::cgi::response::{Response, STATUS_NOT_FOUND};
use crate::parser::Request;
use crate::sandbox::Sandbox;
use crate::{template, Config};


/// The default template name tried after the request-derived candidates.
pub const INDEX_TEMPLATE: &str = "index.tcl";


/// One request's worth of work, dispatched to a leased worker.
#[derive(Debug)]
pub struct Job {
    /// The client socket, owned exclusively from dispatch to close.
    pub socket: TcpStream,
    /// The parsed SCGI request.
    pub request: Request,
    /// The server configuration snapshot.
    pub config: Arc<Config>,
}

/// Serves one request to completion: resolve, execute, flush, close.
pub fn handle(job: Job) {
    let Job { socket, request, config } = job;
    let mut response = Response::new(socket);

    let base = if config.script_path.is_empty() {
        request.get_var_str(cgi::DOCUMENT_ROOT).unwrap_or("")
    } else {
        &config.script_path
    };

    let path = match resolve_template(Path::new(base), &request) {
        Ok(path) => path,
        Err(last) => {
            tracing::debug!(candidate = %last.display(), "template not found");
            response.respond_error(
                STATUS_NOT_FOUND,
                &format!("Could not find {} on the server", last.display()),
            );
            return;
        },
    };
    tracing::debug!(template = %path.display(), "serving template");

    // Templates rely on relative paths resolving next to the template.
    // The working directory is process-wide, so concurrent requests into
    // different directories can race; the design accepts this.
    if let Some(parent) = path.parent() {
        if let Err(e) = std::env::set_current_dir(parent) {
            tracing::warn!(dir = %parent.display(), error = %e, "chdir failed");
        }
    }

    let params = build_params(&request);
    let mut sandbox = Sandbox::new(response, path.clone());
    sandbox.bind_headers(&request);
    sandbox.bind_params(&params);
    sandbox.bind_body(request.body());

    if let Err(e) = template::run(&mut sandbox, &path) {
        sandbox.fail(&format!("{} -- {e}", path.display()));
    }
    sandbox.ensure_flushed();
}


/// Resolves the on-disk template for a request.
///
/// The request-derived suffixes `DOCUMENT_URI`, `SCRIPT_NAME` and
/// `PATH_INFO` (leading `/` stripped) are tried against the base
/// directory in order, then the literal [`INDEX_TEMPLATE`]. The first
/// existing, regular, readable file wins.
///
/// # Errors
/// Returns the last candidate path when nothing resolves, for the 404
/// response body.
pub fn resolve_template(base: &Path, request: &Request) -> Result<PathBuf, PathBuf> {
    let suffixes = [cgi::DOCUMENT_URI, cgi::SCRIPT_NAME, cgi::PATH_INFO]
        .into_iter()
        .filter_map(|name| request.get_var_str(name))
        .chain([INDEX_TEMPLATE]);

    let mut last = base.to_path_buf();
    for suffix in suffixes {
        last = base.join(suffix.trim_start_matches('/'));
        if is_readable_file(&last) {
            return Ok(last);
        }
    }
    Err(last)
}

fn is_readable_file(path: &Path) -> bool {
    std::fs::File::open(path)
        .and_then(|f| f.metadata())
        .map(|m| m.is_file())
        .unwrap_or(false)
}


/// Builds the `params` entries for a request.
///
/// Query-string and URL-encoded form parameters come from the shared
/// token pipeline. For multipart requests the body-derived portion is
/// replaced by the multipart fields, each rendered as a property list of
/// `value`, `filename` and `content-type`.
#[must_use]
pub fn build_params(request: &Request) -> Vec<(String, String)> {
    let mut params = cgi::request_params(request);
    let Some(boundary) = cgi::multipart_boundary(request) else {
        return params;
    };

    for part in Multipart::new(request.body(), boundary) {
        let part = match part {
            Ok(part) => part,
            Err(e) => {
                tracing::warn!(error = %e, "multipart body truncated");
                break;
            },
        };
        let Some(name) = part.name else { continue };

        let mut props = vec![
            Value::from("value"),
            Value::from(String::from_utf8_lossy(part.body).into_owned()),
        ];
        if let Some(filename) = part.filename {
            props.push(Value::from("filename"));
            props.push(Value::from(filename));
        }
        if let Some(ctype) = part.content_type {
            props.push(Value::from("content-type"));
            props.push(Value::from(ctype));
        }
        params.push((name.to_owned(), Value::from(props).as_str().to_owned()));
    }
    params
}
