//! RFC-6570 (level 1) URI template matching.
//!
//! Resource URIs containing `{variable}` placeholders are templates. A
//! template compiles to an anchored regex; `matches` decides whether a
//! concrete URI is an expansion of the template and `extract` recovers the
//! variable values.

use regex::Regex;
use std::collections::HashMap;

use crate::error::Error;

/// A parsed URI template.
#[derive(Debug, Clone)]
pub struct UriTemplate {
    template: String,
    variables: Vec<String>,
    pattern: Option<Regex>,
}

impl UriTemplate {
    /// Parses a template, compiling its match pattern when it contains at
    /// least one `{variable}` placeholder.
    pub fn parse(template: &str) -> Result<Self, Error> {
        let variables = extract_variable_names(template)?;
        let pattern = if variables.is_empty() {
            None
        } else {
            Some(compile(template)?)
        };
        Ok(Self {
            template: template.to_string(),
            variables,
            pattern,
        })
    }

    /// The raw template text.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Whether the template contains any `{variable}` placeholders.
    pub fn is_templated(&self) -> bool {
        !self.variables.is_empty()
    }

    /// Variable names in order of appearance.
    pub fn variable_names(&self) -> &[String] {
        &self.variables
    }

    /// Whether `uri` is the template itself (literal case) or one of its
    /// expansions (templated case).
    pub fn matches(&self, uri: &str) -> bool {
        match &self.pattern {
            Some(regex) => regex.is_match(uri),
            None => self.template == uri,
        }
    }

    /// Extracts variable values from a matching URI; empty map for literal
    /// templates, `None` when the URI does not match.
    pub fn extract(&self, uri: &str) -> Option<HashMap<String, String>> {
        match &self.pattern {
            Some(regex) => {
                let captures = regex.captures(uri)?;
                let mut values = HashMap::new();
                for name in &self.variables {
                    values.insert(name.clone(), captures[name.as_str()].to_string());
                }
                Some(values)
            }
            None => (self.template == uri).then(HashMap::new),
        }
    }
}

/// Pulls the `{variable}` names out of a template, rejecting duplicates and
/// malformed placeholders.
pub fn extract_variable_names(template: &str) -> Result<Vec<String>, Error> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| Error::Other(format!("Unclosed variable in URI template: {template}")))?;
        let name = &after[..close];
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::Other(format!(
                "Invalid variable name '{name}' in URI template: {template}"
            )));
        }
        if names.iter().any(|n| n == name) {
            return Err(Error::Other(format!(
                "Duplicate variable '{name}' in URI template: {template}"
            )));
        }
        names.push(name.to_string());
        rest = &after[close + 1..];
    }
    Ok(names)
}

fn compile(template: &str) -> Result<Regex, Error> {
    let mut pattern = String::from("^");
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        pattern.push_str(&regex::escape(&rest[..open]));
        let after = &rest[open + 1..];
        // extract_variable_names already validated the placeholder
        let close = after.find('}').expect("validated placeholder");
        pattern.push_str(&format!("(?P<{}>.*)", &after[..close]));
        rest = &after[close + 1..];
    }
    pattern.push_str(&regex::escape(rest));
    pattern.push('$');
    Regex::new(&pattern).map_err(|e| Error::Other(format!("Invalid URI template regex: {e}")))
}
