use crate::error::{DevstackError, ErrorDetails, Result};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct JsonResult<T: Serialize> {
    pub ok: bool,
    pub result: Option<T>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
}

#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
}

impl Output {
    pub fn emit<T: Serialize>(&self, summary: &str, payload: &T) -> Result<()> {
        if self.json {
            let wrapper = JsonResult {
                ok: true,
                result: Some(payload),
                error: None,
                error_details: None,
            };
            return print_json(&wrapper);
        }
        println!("{summary}");
        Ok(())
    }

    pub fn emit_error(&self, err: &DevstackError) -> Result<()> {
        if self.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: err.details(),
            };
            return print_json(&payload);
        }
        eprintln!("error: {err}");
        if let Some(hint) = err.details().and_then(|details| details.hint) {
            eprintln!("hint: {hint}");
        }
        Ok(())
    }
}

pub fn print_json<T: Serialize>(payload: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
