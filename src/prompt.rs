//! Prompt templates, rendered with Handlebars.

use handlebars::Handlebars;
use serde::Serialize;

use crate::error::{EngineError, Result};

const PLAN_TEMPLATE: &str = "\
Issue: {{title}}

{{#if body}}{{body}}{{else}}(no description){{/if}}

Write a short implementation plan for this issue.";

const PATCH_TEMPLATE: &str = "\
Plan:
{{plan}}

{{#if snippets}}Relevant files:
{{#each snippets}}
--- {{this.path}} ---
{{this.content}}
{{/each}}
{{/if}}
Repository files:
{{#each files}}{{this}}
{{/each}}
{{#if previous_error}}
Your previous answer was rejected: {{previous_error}}
Correct this and return a valid unified diff.
{{/if}}
Return only a unified diff with `diff --git` headers and `@@` hunks.";

const REVIEW_TEMPLATE: &str = "\
Issue: {{title}}

Plan:
{{plan}}

Pull request:
{{summary}}

Review the change against the issue.";

pub const PLAN: &str = "plan";
pub const PATCH: &str = "patch";
pub const REVIEW: &str = "review";

#[derive(Debug, Clone, Serialize)]
pub struct PlanContext<'a> {
    pub title: &'a str,
    pub body: &'a str,
}

/// Bounded prefix of one repository file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snippet {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatchContext<'a> {
    pub plan: &'a str,
    pub snippets: &'a [Snippet],
    pub files: &'a [String],
    pub previous_error: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewContext<'a> {
    pub title: &'a str,
    pub plan: &'a str,
    pub summary: &'a str,
}

pub struct PromptRenderer {
    handlebars: Handlebars<'static>,
}

impl std::fmt::Debug for PromptRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptRenderer").finish_non_exhaustive()
    }
}

impl PromptRenderer {
    pub fn new() -> Result<Self> {
        let mut handlebars = Handlebars::new();
        handlebars.register_escape_fn(handlebars::no_escape);
        for (name, template) in [(PLAN, PLAN_TEMPLATE), (PATCH, PATCH_TEMPLATE), (REVIEW, REVIEW_TEMPLATE)] {
            handlebars
                .register_template_string(name, template)
                .map_err(|e| EngineError::Config(format!("Failed to register template '{}': {}", name, e)))?;
        }
        Ok(Self { handlebars })
    }

    fn render<T: Serialize>(&self, name: &str, context: &T) -> Result<String> {
        self.handlebars
            .render(name, context)
            .map_err(|e| EngineError::Config(format!("Failed to render template '{}': {}", name, e)))
    }

    pub fn plan(&self, context: &PlanContext<'_>) -> Result<String> {
        self.render(PLAN, context)
    }

    pub fn patch(&self, context: &PatchContext<'_>) -> Result<String> {
        self.render(PATCH, context)
    }

    pub fn review(&self, context: &ReviewContext<'_>) -> Result<String> {
        self.render(REVIEW, context)
    }
}
