//! Skills — instruction documents pinned to a context.
//!
//! A pinned skill id is persisted in context meta, so the skill auto-loads
//! for every subsequent run. Loaded skills contribute their instructions to
//! the system prompt and may restrict the tool set; the shell-command triad
//! stays available regardless so the agent can always operate a session it
//! already opened.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Tools that remain allowed whenever any skill restriction is in effect.
pub const SHELL_TOOL_NAMES: &[&str] = &["exec_command", "write_stdin", "close_shell"];

/// One loadable skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Markdown instructions injected into the ACTIVE SKILLS block.
    pub instructions: String,
    /// Tools this skill needs. `None` means the skill imposes no
    /// restriction at all.
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
}

/// Application-supplied skill catalog.
#[derive(Default)]
pub struct SkillRegistry {
    skills: HashMap<String, Skill>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, skill: Skill) {
        self.skills.insert(skill.id.clone(), skill);
    }

    pub fn get(&self, id: &str) -> Option<&Skill> {
        self.skills.get(id)
    }

    /// Resolve pinned ids to skills, silently skipping unknown ids (a skill
    /// can be unpinned from the catalog while still referenced by old meta).
    pub fn resolve<'a>(&'a self, ids: &[String]) -> Vec<&'a Skill> {
        ids.iter().filter_map(|id| self.skills.get(id)).collect()
    }
}

/// Compute the effective tool allowlist for a set of loaded skills.
///
/// `None` means no restriction: either no skill is loaded, or at least one
/// loaded skill declares no restriction. Otherwise the allowlist is the
/// union of every skill's `allowed_tools` plus [`SHELL_TOOL_NAMES`].
pub fn effective_allowlist(loaded: &[&Skill]) -> Option<HashSet<String>> {
    if loaded.is_empty() {
        return None;
    }
    let mut union: HashSet<String> = HashSet::new();
    for skill in loaded {
        match &skill.allowed_tools {
            None => return None,
            Some(tools) => union.extend(tools.iter().cloned()),
        }
    }
    union.extend(SHELL_TOOL_NAMES.iter().map(|s| s.to_string()));
    Some(union)
}

/// Render the ACTIVE SKILLS system-prompt block for the loaded skills.
pub fn active_skills_block(loaded: &[&Skill], effective_tools: &[String]) -> String {
    let mut block = String::from("## ACTIVE SKILLS\n");
    for skill in loaded {
        block.push_str(&format!("\n### {} ({})\n", skill.name, skill.id));
        block.push_str(&skill.instructions);
        if !block.ends_with('\n') {
            block.push('\n');
        }
        match &skill.allowed_tools {
            Some(tools) => {
                block.push_str(&format!("Tools required: {}\n", tools.join(", ")));
            }
            None => block.push_str("Tools required: (no restriction)\n"),
        }
    }
    block.push_str(&format!(
        "\nEffective tools this run: {}\n",
        effective_tools.join(", ")
    ));
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skill(id: &str, tools: Option<&[&str]>) -> Skill {
        Skill {
            id: id.into(),
            name: id.to_uppercase(),
            description: format!("{id} skill"),
            instructions: format!("Use the {id} workflow."),
            allowed_tools: tools.map(|t| t.iter().map(|s| s.to_string()).collect()),
        }
    }

    #[test]
    fn no_skills_means_no_restriction() {
        assert!(effective_allowlist(&[]).is_none());
    }

    #[test]
    fn unrestricted_skill_lifts_all_gating() {
        let a = skill("a", Some(&["read_file"]));
        let b = skill("b", None);
        assert!(effective_allowlist(&[&a, &b]).is_none());
    }

    #[test]
    fn allowlist_is_union_plus_shell_triad() {
        let a = skill("a", Some(&["read_file"]));
        let b = skill("b", Some(&["chat_send"]));
        let set = effective_allowlist(&[&a, &b]).unwrap();
        assert!(set.contains("read_file"));
        assert!(set.contains("chat_send"));
        for name in SHELL_TOOL_NAMES {
            assert!(set.contains(*name));
        }
        assert_eq!(set.len(), 5);
    }

    #[test]
    fn skills_block_lists_instructions_and_tools() {
        let a = skill("deploy", Some(&["exec_command"]));
        let block = active_skills_block(&[&a], &["exec_command".into(), "write_stdin".into()]);
        assert!(block.starts_with("## ACTIVE SKILLS"));
        assert!(block.contains("DEPLOY (deploy)"));
        assert!(block.contains("Use the deploy workflow."));
        assert!(block.contains("Effective tools this run: exec_command, write_stdin"));
    }

    #[test]
    fn registry_resolve_skips_unknown_ids() {
        let mut reg = SkillRegistry::new();
        reg.register(skill("a", None));
        let resolved = reg.resolve(&["a".into(), "ghost".into()]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, "a");
    }
}
