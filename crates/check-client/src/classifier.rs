//! Response classification
//!
//! Turns an HTTP status and body into a `CheckResult`. Status codes are
//! handled first; a 200 body is then run through an ordered list of matchers,
//! each recognizing one response shape. The first matcher that returns a
//! verdict wins. A body no matcher recognizes still yields an `Error` result
//! with whatever status-like fields it carried.
//!
//! The upstream contract has shifted across time and markets, so the chain is
//! deliberately permissive: every input produces a result, never a panic.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use check_core::{CheckResult, Failure, FailureClass, Outcome};
use serde_json::{Map, Value};
use tracing::{debug, warn};

type Body = Map<String, Value>;

/// A matcher's conclusion before it is stamped into a `CheckResult`.
struct Verdict {
    outcome: Outcome,
    detail: String,
}

impl Verdict {
    fn new(outcome: Outcome, detail: impl Into<String>) -> Self {
        Self {
            outcome,
            detail: detail.into(),
        }
    }
}

type Matcher = fn(&str, &Body) -> Option<Verdict>;

/// Body matchers in priority order.
const MATCHERS: [(&str, Matcher); 6] = [
    ("inner_error", inner_error),
    ("cart_events", cart_events),
    ("token_state", token_state),
    ("error_code", error_code),
    ("message_keywords", message_keywords),
    ("body_scan", body_scan),
];

const INNER_EXPIRED_CODES: [&str; 4] =
    ["TokenExpired", "RedeemTokenExpired", "ExpiredToken", "CodeExpired"];
const INNER_EXPIRED_KEYWORDS: [&str; 3] = ["expired", "no longer valid", "cannot be redeemed"];
const INNER_INVALID_CODES: [&str; 4] = ["InvalidToken", "InvalidRedeemToken", "NotFound", "BadRequest"];

const EXPIRY_FIELDS: [&str; 5] = ["tokenExpiryDate", "expiryDate", "expiry", "validUntil", "expires"];
const EXPIRY_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

const ERROR_CODES: [(&str, Outcome, &str); 11] = [
    ("NotFound", Outcome::Invalid, "code not found"),
    ("Expired", Outcome::Expired, "code expired"),
    ("TokenExpired", Outcome::Expired, "code expired"),
    ("InvalidToken", Outcome::Invalid, "invalid code"),
    ("InvalidRedeemToken", Outcome::Invalid, "invalid code for redemption"),
    ("Unauthorized", Outcome::Error, "unauthorized, credential rejected"),
    ("Forbidden", Outcome::Error, "access forbidden"),
    ("BadRequest", Outcome::Invalid, "malformed code"),
    ("InternalServerError", Outcome::Error, "internal server error"),
    ("ServiceUnavailable", Outcome::Error, "service unavailable"),
    ("TooManyRequests", Outcome::Error, "too many requests"),
];

const MESSAGE_KEYWORDS: [(Outcome, &[&str]); 3] = [
    (
        Outcome::Expired,
        &[
            "expired",
            "cannot be redeemed",
            "this token has expired",
            "token is no longer valid",
            "redemption code has expired",
            "code has expired",
            "no longer available",
        ],
    ),
    (
        Outcome::Used,
        &[
            "already redeemed",
            "already used",
            "previously redeemed",
            "code has been used",
            "already claimed",
        ],
    ),
    (
        Outcome::Invalid,
        &[
            "invalid code",
            "not found",
            "does not exist",
            "invalid format",
            "malformed",
            "not valid",
        ],
    ),
];

const SUMMARY_STATUS_FIELDS: [&str; 4] = ["status", "state", "result", "outcome"];
const SUMMARY_MESSAGE_FIELDS: [&str; 4] = ["message", "description", "error", "reason"];
const SUMMARY_VALUE_CHARS: usize = 100;

/// Classify a complete response.
pub fn classify(code: &str, status: u16, retry_after: Option<Duration>, body: &[u8]) -> CheckResult {
    if let Some(result) = classify_status(code, status, retry_after) {
        return result;
    }

    let parsed: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            let preview = String::from_utf8_lossy(&body[..body.len().min(500)]).into_owned();
            warn!(code, error = %e, body = %preview, "response body is not valid JSON");
            return CheckResult::new(code, Outcome::Error, format!("invalid JSON response: {e}"))
                .with_failure(Failure::new(
                    FailureClass::Unknown,
                    format!("invalid JSON response: {e}"),
                ));
        }
    };

    if !parsed.is_object() {
        let raw: String = parsed.to_string().chars().take(200).collect();
        return CheckResult::new(code, Outcome::Error, "response is not a JSON object")
            .with_raw(&serde_json::json!({ "raw_response": raw }));
    }
    classify_body(code, &parsed)
}

/// Status-code special cases. Returns `None` for 200, meaning the body
/// decides the outcome.
pub fn classify_status(code: &str, status: u16, retry_after: Option<Duration>) -> Option<CheckResult> {
    let result = match status {
        200 => return None,
        429 => {
            let detail = match retry_after {
                Some(after) => format!("rate limited (retry after {}s)", after.as_secs()),
                None => "rate limited".to_string(),
            };
            CheckResult::new(code, Outcome::RateLimited, detail.clone())
                .with_failure(Failure::http(status, detail).with_retry_after(retry_after))
        }
        401 => CheckResult::new(
            code,
            Outcome::CredentialError,
            "credential rejected (401 Unauthorized)",
        )
        .with_failure(Failure::http(status, "unauthorized")),
        403 => CheckResult::new(code, Outcome::Error, "access denied (403 Forbidden)")
            .with_failure(Failure::http(status, "forbidden")),
        404 => CheckResult::new(code, Outcome::Invalid, "code not found (404 Not Found)"),
        500..=599 => {
            let detail = server_error_message(status);
            CheckResult::new(code, Outcome::Error, detail.clone())
                .with_failure(Failure::http(status, detail))
        }
        other => {
            let detail = format!("unexpected HTTP status {other}");
            CheckResult::new(code, Outcome::Error, detail.clone())
                .with_failure(Failure::http(other, detail))
        }
    };
    Some(result)
}

fn server_error_message(status: u16) -> String {
    match status {
        500 => "internal server error".into(),
        502 => "bad gateway".into(),
        503 => "service unavailable".into(),
        504 => "gateway timeout".into(),
        other => format!("server error ({other})"),
    }
}

/// Classify a parsed 200 body.
pub fn classify_body(code: &str, body: &Value) -> CheckResult {
    let Some(map) = body.as_object() else {
        return CheckResult::new(code, Outcome::Error, "response is not a JSON object").with_raw(body);
    };

    for (name, matcher) in MATCHERS {
        if let Some(verdict) = matcher(code, map) {
            debug!(code, matcher = name, outcome = %verdict.outcome, "response classified");
            return CheckResult::new(code, verdict.outcome, verdict.detail).with_raw(body);
        }
    }

    let keys: Vec<&str> = map.keys().map(String::as_str).collect();
    warn!(code, ?keys, "unrecognized response structure");
    CheckResult::new(
        code,
        Outcome::Error,
        format!("could not determine code status: {}", summarize(map)),
    )
    .with_raw(body)
}

fn str_field<'a>(map: &'a Body, key: &str) -> &'a str {
    map.get(key).and_then(Value::as_str).unwrap_or("")
}

fn or_else<'a>(preferred: &'a str, fallback: &'a str) -> &'a str {
    if preferred.is_empty() { fallback } else { preferred }
}

fn inner_error(_code: &str, body: &Body) -> Option<Verdict> {
    let inner = body.get("innererror")?.as_object()?;
    let inner_code = str_field(inner, "code");
    let message = str_field(inner, "message").to_lowercase();

    let data_expired = inner
        .get("data")
        .and_then(Value::as_array)
        .is_some_and(|items| {
            items.iter().any(|item| match item {
                Value::String(s) => s.to_lowercase().contains("expired"),
                Value::Object(_) => item.to_string().to_lowercase().contains("expired"),
                _ => false,
            })
        });

    if INNER_EXPIRED_CODES.contains(&inner_code)
        || INNER_EXPIRED_KEYWORDS.iter().any(|k| message.contains(k))
        || data_expired
    {
        return Some(Verdict::new(
            Outcome::Expired,
            format!("code expired: {}", or_else(&message, inner_code)),
        ));
    }
    if INNER_INVALID_CODES.contains(&inner_code) {
        return Some(Verdict::new(
            Outcome::Invalid,
            format!("invalid code: {}", or_else(&message, inner_code)),
        ));
    }
    None
}

fn cart_events(_code: &str, body: &Body) -> Option<Verdict> {
    let cart = body.get("events")?.as_object()?.get("cart")?.as_array()?;
    for event in cart.iter().filter_map(Value::as_object) {
        if event.get("type").and_then(Value::as_str) != Some("error") {
            continue;
        }
        if str_field(event, "code") != "InvalidRedeemToken" {
            continue;
        }
        let reason = event
            .get("data")
            .and_then(Value::as_object)
            .map(|data| str_field(data, "reason"))
            .unwrap_or("");
        return Some(if reason == "RedeemTokenExpired" {
            Verdict::new(Outcome::Expired, "code expired and cannot be redeemed")
        } else {
            Verdict::new(
                Outcome::Invalid,
                format!("invalid code: {}", or_else(reason, "unknown reason")),
            )
        });
    }
    None
}

fn token_state(code: &str, body: &Body) -> Option<Verdict> {
    let state = body.get("tokenState")?;
    let verdict = match state.as_str() {
        Some("Active") => match expired_at(code, body) {
            Some(expiry) => Verdict::new(
                Outcome::Expired,
                format!("code expired {}", expiry.format("%Y-%m-%d %H:%M")),
            ),
            None => Verdict::new(Outcome::Valid, "code is active and unused"),
        },
        Some("Redeemed") => Verdict::new(Outcome::Used, "code already redeemed"),
        Some("Expired") => Verdict::new(Outcome::Expired, "code expired"),
        Some("Invalid") => Verdict::new(Outcome::Invalid, "code invalid"),
        _ => {
            let shown = state.as_str().map_or_else(|| state.to_string(), str::to_string);
            warn!(code, token_state = %shown, "unknown tokenState value");
            Verdict::new(Outcome::Error, format!("unknown token state: {shown}"))
        }
    };
    Some(verdict)
}

/// The expiry timestamp if the body carries one that is already past.
///
/// The first expiry field holding a parseable date decides; unparseable
/// values are logged and the next field is tried.
fn expired_at(code: &str, body: &Body) -> Option<DateTime<Utc>> {
    for field in EXPIRY_FIELDS {
        let Some(raw) = body.get(field).and_then(Value::as_str) else {
            continue;
        };
        match parse_expiry(raw) {
            Some(expiry) if expiry < Utc::now() => return Some(expiry),
            Some(_) => return None,
            None => warn!(code, field, value = raw, "could not parse expiry date"),
        }
    }
    None
}

/// Parse the date formats seen in expiry fields. Values without an offset
/// are taken as UTC.
fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    let stripped = raw.replace('Z', "");
    for format in EXPIRY_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&stripped, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(&stripped, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn error_code(code: &str, body: &Body) -> Option<Verdict> {
    let value = body.get("code")?;
    let message = str_field(body, "message");
    let known = value
        .as_str()
        .and_then(|name| ERROR_CODES.iter().find(|(known, _, _)| *known == name));

    Some(match known {
        Some((_, outcome, default)) => Verdict::new(*outcome, or_else(message, default)),
        None => {
            let shown = value.as_str().map_or_else(|| value.to_string(), str::to_string);
            warn!(code, error_code = %shown, "unknown error code");
            Verdict::new(
                Outcome::Error,
                format!("unknown API error: {shown} - {message}"),
            )
        }
    })
}

fn message_keywords(_code: &str, body: &Body) -> Option<Verdict> {
    let message = str_field(body, "message");
    let description = str_field(body, "description");
    let combined = format!("{message} {description}").trim().to_lowercase();
    if combined.is_empty() {
        return None;
    }

    MESSAGE_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| combined.contains(k)))
        .map(|(outcome, _)| {
            Verdict::new(
                *outcome,
                format!("matched by message: {}", or_else(message, description)),
            )
        })
}

fn body_scan(_code: &str, body: &Body) -> Option<Verdict> {
    let text = serde_json::to_string(body).ok()?.to_lowercase();
    if text.contains("expired") && (text.contains("token") || text.contains("code")) {
        return Some(Verdict::new(
            Outcome::Expired,
            "code expired (inferred from response content)",
        ));
    }
    if text.contains("cannot be redeemed") || text.contains("not available") {
        return Some(Verdict::new(
            Outcome::Invalid,
            "code not available for redemption",
        ));
    }
    None
}

/// Best-effort summary of status-like and message-like fields.
fn summarize(body: &Body) -> String {
    let display = |value: &Value| match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let mut parts: Vec<String> = SUMMARY_STATUS_FIELDS
        .iter()
        .filter_map(|field| body.get(*field).map(|v| format!("{field}: {}", display(v))))
        .collect();
    parts.extend(SUMMARY_MESSAGE_FIELDS.iter().filter_map(|field| {
        body.get(*field).map(|v| {
            let text: String = display(v).chars().take(SUMMARY_VALUE_CHARS).collect();
            format!("{field}: {text}")
        })
    }));

    if parts.is_empty() {
        "unrecognized response structure".into()
    } else {
        parts.join("; ")
    }
}
