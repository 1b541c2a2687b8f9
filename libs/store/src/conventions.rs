//! Startup-time resolution of the message direction/sender column literals.
//!
//! Deployments disagree on the literal values their check constraints allow
//! (`in`/`out` vs `inbound`/`outbound`, `agent`/`contact` vs
//! `agent`/`user`). The resolver reads the live constraint definitions once,
//! derives the valid set, and returns an immutable [`WireConventions`] that
//! callers receive by injection. Environment overrides beat introspection;
//! an unreadable catalog falls back to the static default.

use obx_core::WireConventions;
use regex::Regex;
use sqlx::PgPool;
use tracing::{info, warn};

const DIRECTION_ENV: &str = "OBX_DIRECTION_VALUES";
const SENDER_ENV: &str = "OBX_SENDER_VALUES";

/// Known literal pairs, probed in order against the constraint text.
const DIRECTION_PAIRS: &[(&str, &str)] = &[("in", "out"), ("inbound", "outbound")];
const SENDER_PAIRS: &[(&str, &str)] = &[("agent", "contact"), ("agent", "user"), ("staff", "customer")];

/// Resolves conventions for the process lifetime.
pub async fn resolve_conventions(pool: &PgPool) -> WireConventions {
    let mut conventions = WireConventions::default();

    match load_check_definitions(pool).await {
        Ok(definitions) => {
            if let Some((d_in, d_out)) =
                pick_pair(&definitions, "direction", DIRECTION_PAIRS)
            {
                conventions.direction_in = d_in;
                conventions.direction_out = d_out;
            }
            if let Some((agent, contact)) = pick_pair(&definitions, "sender", SENDER_PAIRS) {
                conventions.sender_agent = agent;
                conventions.sender_contact = contact;
            }
        }
        Err(err) => {
            warn!(error = %err, "constraint introspection failed, using default conventions");
        }
    }

    apply_env_overrides(&mut conventions);
    info!(
        direction_in = %conventions.direction_in,
        direction_out = %conventions.direction_out,
        sender_agent = %conventions.sender_agent,
        sender_contact = %conventions.sender_contact,
        "wire conventions resolved"
    );
    conventions
}

async fn load_check_definitions(pool: &PgPool) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT pg_get_constraintdef(oid) FROM pg_constraint \
         WHERE conrelid = 'messages'::regclass AND contype = 'c'",
    )
    .fetch_all(pool)
    .await
}

/// Picks the first known literal pair fully contained in the constraint that
/// mentions `column`.
pub(crate) fn pick_pair(
    definitions: &[String],
    column: &str,
    pairs: &[(&str, &str)],
) -> Option<(String, String)> {
    let definition = definitions
        .iter()
        .find(|def| def.contains(column))?;
    let literals = quoted_literals(definition);
    pairs
        .iter()
        .find(|(a, b)| {
            literals.iter().any(|l| l == a) && literals.iter().any(|l| l == b)
        })
        .map(|(a, b)| (a.to_string(), b.to_string()))
}

fn quoted_literals(definition: &str) -> Vec<String> {
    // pg_get_constraintdef renders literals as 'value'::text
    let re = Regex::new(r"'([^']+)'").unwrap();
    re.captures_iter(definition)
        .map(|cap| cap[1].to_string())
        .collect()
}

fn apply_env_overrides(conventions: &mut WireConventions) {
    if let Ok(raw) = std::env::var(DIRECTION_ENV) {
        match WireConventions::parse_pair(&raw) {
            Some((d_in, d_out)) => {
                conventions.direction_in = d_in;
                conventions.direction_out = d_out;
            }
            None => warn!(raw = %raw, "ignoring malformed {DIRECTION_ENV}"),
        }
    }
    if let Ok(raw) = std::env::var(SENDER_ENV) {
        match WireConventions::parse_pair(&raw) {
            Some((agent, contact)) => {
                conventions.sender_agent = agent;
                conventions.sender_contact = contact;
            }
            None => warn!(raw = %raw, "ignoring malformed {SENDER_ENV}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defs(direction: &str, sender: &str) -> Vec<String> {
        vec![direction.to_string(), sender.to_string()]
    }

    #[test]
    fn picks_long_literals_from_constraint_text() {
        let definitions = defs(
            "CHECK ((direction = ANY (ARRAY['inbound'::text, 'outbound'::text])))",
            "CHECK ((sender = ANY (ARRAY['agent'::text, 'user'::text])))",
        );
        assert_eq!(
            pick_pair(&definitions, "direction", DIRECTION_PAIRS),
            Some(("inbound".into(), "outbound".into()))
        );
        assert_eq!(
            pick_pair(&definitions, "sender", SENDER_PAIRS),
            Some(("agent".into(), "user".into()))
        );
    }

    #[test]
    fn prefers_short_pair_when_both_present() {
        let definitions = defs(
            "CHECK ((direction IN ('in', 'out', 'inbound', 'outbound')))",
            "CHECK ((sender IN ('agent', 'contact')))",
        );
        assert_eq!(
            pick_pair(&definitions, "direction", DIRECTION_PAIRS),
            Some(("in".into(), "out".into()))
        );
    }

    #[test]
    fn unknown_literals_yield_none() {
        let definitions = defs(
            "CHECK ((direction = ANY (ARRAY['tx'::text, 'rx'::text])))",
            "CHECK ((sender IS NOT NULL))",
        );
        assert_eq!(pick_pair(&definitions, "direction", DIRECTION_PAIRS), None);
        assert_eq!(pick_pair(&definitions, "sender", SENDER_PAIRS), None);
    }

    #[test]
    fn env_override_beats_introspection() {
        let mut conventions = WireConventions::default();
        // Same parsing path resolve_conventions uses after introspection.
        unsafe { std::env::set_var(DIRECTION_ENV, "inbound:outbound") };
        apply_env_overrides(&mut conventions);
        unsafe { std::env::remove_var(DIRECTION_ENV) };
        assert_eq!(conventions.direction_in, "inbound");
        assert_eq!(conventions.direction_out, "outbound");
        assert_eq!(conventions.sender_agent, "agent");
    }
}
