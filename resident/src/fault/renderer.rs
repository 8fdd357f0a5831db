use thiserror::Error;

use crate::core::errors::{Fault, FaultKind};
use crate::core::request::Request;
use crate::core::response::Response;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to encode the error body: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{0}")]
    Template(String),
}

///
/// Turns a fault into an error page on the response. The lifecycle only
/// knows this trait; applications plug in their own error views.
///
pub trait FaultRenderer: Send + Sync {
    fn render(
        &self,
        fault: &Fault,
        request: &Request,
        debug: bool,
        response: &mut Response,
    ) -> Result<(), RenderError>;
}

pub const GENERIC_MESSAGE: &str = "An internal server error occurred.";

pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());

    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#039;"),
            _ => escaped.push(c),
        }
    }

    escaped
}

///
/// The default renderer. Debug pages show the cause chain and backtrace;
/// otherwise only HTTP faults reveal their reason phrase. Ajax requests get
/// JSON.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct HtmlFaultRenderer;

impl HtmlFaultRenderer {
    fn public_message(fault: &Fault) -> String {
        match fault.kind {
            FaultKind::Http => fault.name(),
            _ => GENERIC_MESSAGE.to_owned(),
        }
    }
}

impl FaultRenderer for HtmlFaultRenderer {
    fn render(
        &self,
        fault: &Fault,
        request: &Request,
        debug: bool,
        response: &mut Response,
    ) -> Result<(), RenderError> {
        if request.is_ajax() {
            let message = if debug {
                fault.message.clone()
            } else {
                Self::public_message(fault)
            };
            let mut body = serde_json::json!({
                "name": fault.name(),
                "message": message,
                "status": fault.status_code(),
            });
            if debug {
                body["chain"] = serde_json::json!(fault.chain());
            }

            response.json(&body)?;
            return Ok(());
        }

        let html = if debug {
            format!(
                "<!DOCTYPE html>\n<html><head><title>{name}</title></head><body>\
                 <h1>{name}</h1><p>{message}</p><pre>{chain}</pre><pre>{backtrace}</pre>\
                 <p>{method} {url}</p></body></html>",
                name = escape_html(&fault.name()),
                message = escape_html(&fault.message),
                chain = escape_html(&fault.chain().join("\n")),
                backtrace = escape_html(&fault.backtrace().to_string()),
                method = escape_html(request.method()),
                url = escape_html(&request.url()),
            )
        } else {
            format!(
                "<!DOCTYPE html>\n<html><head><title>{name}</title></head><body>\
                 <h1>{name}</h1><p>{message}</p></body></html>",
                name = escape_html(&fault.name()),
                message = escape_html(&Self::public_message(fault)),
            )
        };

        response.set("Content-Type", "text/html; charset=UTF-8");
        response.body(&html);

        Ok(())
    }
}
