//! Context assembly: one text blob per record for the embedding model.
//!
//! The blob is a short header naming who, what, and when, followed by the
//! record body:
//!
//! ```text
//! Subject: Renewal pricing
//! From: Dana Reyes <dana@acme.io>
//! Organization: Acme Corp
//! Deal: Acme 2025 renewal
//! Date: 2025-03-14
//!
//! Hi, following up on the proposal...
//! ```
//!
//! A header line whose value is missing or blank is left out entirely. A
//! record with no descriptive field and a blank body yields an empty string.
//! Output depends only on the record's fields.

use crate::models::{EmailDirection, RecordKind, VectorizableRecord};

/// Build the embedding input for `record`.
pub fn build_context(record: &VectorizableRecord) -> String {
    let ctx = &record.context;
    let mut lines: Vec<String> = Vec::with_capacity(6);

    let subject_label = match record.key.kind {
        RecordKind::Call => "Call",
        RecordKind::Email => "Subject",
    };
    push_field(&mut lines, subject_label, ctx.subject.as_deref());

    let counterpart_label = match (record.key.kind, ctx.direction) {
        (RecordKind::Email, Some(EmailDirection::Inbound)) => "From",
        (RecordKind::Email, Some(EmailDirection::Outbound)) => "To",
        _ => "Contact",
    };
    push_field(
        &mut lines,
        counterpart_label,
        counterpart(ctx.contact_name.as_deref(), ctx.contact_email.as_deref()).as_deref(),
    );

    push_field(&mut lines, "Organization", ctx.organization.as_deref());
    push_field(&mut lines, "Deal", ctx.deal.as_deref());

    let body = record.primary_text.trim();
    if lines.is_empty() && body.is_empty() {
        // A bare date carries no meaning worth a vector
        return String::new();
    }
    if let Some(at) = record.occurred_at {
        lines.push(format!("Date: {}", at.format("%Y-%m-%d")));
    }

    let mut out = lines.join("\n");
    if !body.is_empty() {
        out.push_str("\n\n");
        out.push_str(body);
    }
    out
}

fn push_field(lines: &mut Vec<String>, label: &str, value: Option<&str>) {
    if let Some(v) = non_blank(value) {
        lines.push(format!("{}: {}", label, v));
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// `Name <email>`, or whichever half is present.
fn counterpart(name: Option<&str>, email: Option<&str>) -> Option<String> {
    match (non_blank(name), non_blank(email)) {
        (Some(n), Some(e)) => Some(format!("{} <{}>", n, e)),
        (Some(n), None) => Some(n.to_string()),
        (None, Some(e)) => Some(e.to_string()),
        (None, None) => None,
    }
}
