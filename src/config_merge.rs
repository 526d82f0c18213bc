//! Carry user customizations of `postgresql.conf` across upgrades.
//!
//! The base file is regenerated on every reconcile. User settings live in the
//! overlay key and are appended to the generated base. Installations from
//! before the overlay key existed edited the base file in place; those lines
//! are detected by comparing against every known generated template and moved
//! into the overlay once.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::ConfigMap;
use tracing::*;

pub static BASE_KEY: &str = "postgresql.conf";
pub static OVERLAY_KEY: &str = "postgresql-custom.conf";
pub static MIGRATION_HEADER: &str = "# Custom configuration migrated from postgresql.conf";

fn data<'a>(cm: &'a ConfigMap, key: &str) -> &'a str {
    cm.data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(String::as_str)
        .unwrap_or_default()
}

/// Merge the live ConfigMap into the freshly generated one.
///
/// `known_templates` are base files generated by earlier releases; the base
/// generated for this release is always considered known.
pub fn merge_postgres_config(existing: &ConfigMap, new: &mut ConfigMap, known_templates: &[&str]) {
    let generated = data(new, BASE_KEY).to_string();
    let existing_overlay = data(existing, OVERLAY_KEY);

    let overlay = if !existing_overlay.trim().is_empty() {
        existing_overlay.to_string()
    } else {
        match legacy_customization(data(existing, BASE_KEY), &generated, known_templates) {
            Some(migrated) => {
                info!(
                    "Migrating custom settings of {} into {}",
                    BASE_KEY, OVERLAY_KEY
                );
                migrated
            }
            None => return,
        }
    };

    let custom = overlay.trim();
    let merged = if already_generated(custom, &generated) {
        generated
    } else {
        format!("{}\n{}\n", generated.trim_end(), custom)
    };
    let new_data = new.data.get_or_insert_with(Default::default);
    new_data.insert(BASE_KEY.to_string(), merged);
    new_data.insert(OVERLAY_KEY.to_string(), overlay);
}

/// True when every overlay line is a whole line of the generated base
fn already_generated(custom: &str, generated: &str) -> bool {
    let lines: BTreeSet<&str> = generated.lines().map(str::trim).collect();
    custom
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .all(|l| lines.contains(l))
}

/// Lines of a base file edited in place that belong to no generated template
fn legacy_customization(
    existing_base: &str,
    generated: &str,
    known_templates: &[&str],
) -> Option<String> {
    let base = existing_base.trim();
    if base.is_empty()
        || base == generated.trim()
        || known_templates.iter().any(|t| t.trim() == base)
    {
        return None;
    }

    let known: BTreeSet<&str> = known_templates
        .iter()
        .copied()
        .chain(std::iter::once(generated))
        .flat_map(str::lines)
        .map(str::trim)
        .collect();
    let mut seen = BTreeSet::new();
    let custom: Vec<&str> = base
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && *l != MIGRATION_HEADER && !known.contains(l))
        .filter(|l| seen.insert(*l))
        .collect();
    if custom.is_empty() {
        return None;
    }
    Some(format!("{MIGRATION_HEADER}\n{}\n", custom.join("\n")))
}
