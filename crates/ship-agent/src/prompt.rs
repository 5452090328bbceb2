//! System-prompt composition.
//!
//! Rebuilt on every run and never persisted. Order: runtime-context block,
//! profile files, per-context memory, project Agent.md, application system
//! texts, then the ACTIVE SKILLS block when skills are pinned.

use std::path::Path;

use tracing::debug;

use ship_core::{RequestContext, ShipPaths};

/// Profile files loaded from `.ship/profile/`, in order.
const PROFILE_FILES: &[&str] = &["Primary.md", "Other.md"];

/// Compose the full system prompt for one run.
pub fn compose(
    paths: &ShipPaths,
    ctx: &RequestContext,
    system_texts: &[String],
    skills_block: Option<&str>,
) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(runtime_context_block(paths, ctx));

    for name in PROFILE_FILES {
        if let Some(text) = read_if_present(&paths.profile_dir().join(name)) {
            sections.push(text);
        }
    }

    if let Ok(memory_path) = paths.context_memory_file(&ctx.context_id) {
        if let Some(text) = read_if_present(&memory_path) {
            sections.push(format!("## Context memory\n\n{text}"));
        }
    }

    if let Some(text) = read_if_present(&paths.agent_file()) {
        sections.push(text);
    }

    for text in system_texts {
        if !text.trim().is_empty() {
            sections.push(text.clone());
        }
    }

    if let Some(block) = skills_block {
        sections.push(block.to_string());
    }

    sections.join("\n\n")
}

/// The always-present header describing where and for whom this run executes.
fn runtime_context_block(paths: &ShipPaths, ctx: &RequestContext) -> String {
    let mut block = String::from("## Runtime context\n");
    block.push_str(&format!("- project root: {}\n", paths.root().display()));
    block.push_str(&format!("- context: {}\n", ctx.context_id));
    block.push_str(&format!("- request: {}\n", ctx.request_id));
    if !ctx.channel.is_empty() {
        block.push_str(&format!("- channel: {}\n", ctx.channel));
    }
    if !ctx.target_id.is_empty() {
        block.push_str(&format!("- target: {}\n", ctx.target_id));
    }
    if !ctx.actor_id.is_empty() {
        match &ctx.actor_name {
            Some(name) => block.push_str(&format!("- actor: {} ({})\n", name, ctx.actor_id)),
            None => block.push_str(&format!("- actor: {}\n", ctx.actor_id)),
        }
    }
    block
}

fn read_if_present(path: &Path) -> Option<String> {
    if !path.is_file() {
        return None;
    }
    match std::fs::read_to_string(path) {
        Ok(text) if !text.trim().is_empty() => Some(text.trim_end().to_string()),
        Ok(_) => None,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "skipping unreadable prompt file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext {
            context_id: "tg:42".into(),
            request_id: "req-1".into(),
            channel: "telegram".into(),
            target_id: "42".into(),
            actor_id: "u7".into(),
            actor_name: Some("Sam".into()),
            ..Default::default()
        }
    }

    #[test]
    fn compose_orders_sections() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ShipPaths::new(dir.path());
        std::fs::create_dir_all(paths.profile_dir()).unwrap();
        std::fs::write(paths.profile_dir().join("Primary.md"), "profile primary").unwrap();
        std::fs::write(paths.agent_file(), "agent instructions").unwrap();

        let prompt = compose(
            &paths,
            &ctx(),
            &["app text".to_string()],
            Some("## ACTIVE SKILLS\nskill stuff"),
        );

        let runtime = prompt.find("## Runtime context").unwrap();
        let profile = prompt.find("profile primary").unwrap();
        let agent = prompt.find("agent instructions").unwrap();
        let app = prompt.find("app text").unwrap();
        let skills = prompt.find("## ACTIVE SKILLS").unwrap();
        assert!(runtime < profile && profile < agent && agent < app && app < skills);
        assert!(prompt.contains("- actor: Sam (u7)"));
    }

    #[test]
    fn absent_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ShipPaths::new(dir.path());
        let prompt = compose(&paths, &ctx(), &[], None);
        assert!(prompt.contains("## Runtime context"));
        assert!(!prompt.contains("Context memory"));
    }

    #[test]
    fn context_memory_is_included_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ShipPaths::new(dir.path());
        let mem = paths.context_memory_file("tg:42").unwrap();
        std::fs::create_dir_all(mem.parent().unwrap()).unwrap();
        std::fs::write(&mem, "remember the port is 8080").unwrap();

        let prompt = compose(&paths, &ctx(), &[], None);
        assert!(prompt.contains("## Context memory"));
        assert!(prompt.contains("remember the port is 8080"));
    }
}
