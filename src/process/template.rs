use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use crate::registry::Service;

/// Minimum Jaro-Winkler score to consider a placeholder a close match.
const PLACEHOLDER_SUGGESTION_THRESHOLD: f64 = 0.8;

/// `{NAME}` placeholders. A leading `$` marks shell syntax (`${NAME}`), which
/// is captured so it can be left alone.
static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\$?)\{([A-Z][A-Z0-9_]*)\}").expect("placeholder regex must compile")
});

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TemplateError {
    #[error("unresolved placeholder '{{{placeholder}}}' in {field}{}", suggestion.as_ref().map(|s| format!(" (did you mean `{{{}}}`?)", s)).unwrap_or_default())]
    UnresolvedPlaceholder {
        field: String,
        placeholder: String,
        suggestion: Option<String>,
    },

    #[error("{field} uses {{PORT}} but the service has no port assigned")]
    MissingPort { field: String },
}

/// A command line and child environment with every placeholder substituted.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedLaunch {
    pub command: String,
    /// `PORT` and `HOST` first, then the service's overrides on top.
    pub env: BTreeMap<String, String>,
}

fn find_closest_placeholder<'a>(name: &str, vars: &'a HashMap<String, String>) -> Option<&'a str> {
    let mut best: Option<(&str, f64)> = None;
    for key in vars.keys() {
        let score = strsim::jaro_winkler(name, key);
        if score >= PLACEHOLDER_SUGGESTION_THRESHOLD && best.is_none_or(|(_, s)| score > s) {
            best = Some((key.as_str(), score));
        }
    }
    best.map(|(name, _)| name)
}

/// Substitute `{NAME}` placeholders in `input` from `vars`.
///
/// Every unknown placeholder is reported, not just the first.
pub fn render(
    input: &str,
    vars: &HashMap<String, String>,
    field: &str,
) -> Result<String, Vec<TemplateError>> {
    let errors: Vec<TemplateError> = PLACEHOLDER_RE
        .captures_iter(input)
        .filter(|cap| cap[1].is_empty())
        .filter_map(|cap| {
            let placeholder = cap[2].to_string();
            if vars.contains_key(&placeholder) {
                None
            } else if placeholder == "PORT" {
                Some(TemplateError::MissingPort {
                    field: field.to_string(),
                })
            } else {
                let suggestion = find_closest_placeholder(&placeholder, vars).map(String::from);
                Some(TemplateError::UnresolvedPlaceholder {
                    field: field.to_string(),
                    placeholder,
                    suggestion,
                })
            }
        })
        .collect();

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(substitute(input, vars))
}

/// Replace the placeholders found in `vars`, leaving every other one as is.
fn substitute(input: &str, vars: &HashMap<String, String>) -> String {
    PLACEHOLDER_RE
        .replace_all(input, |cap: &regex::Captures| {
            if !cap[1].is_empty() {
                return cap[0].to_string();
            }
            match vars.get(&cap[2]) {
                Some(value) => value.clone(),
                None => cap[0].to_string(),
            }
        })
        .into_owned()
}

/// Resolve `command` and the child environment for `service`.
///
/// `{PORT}` and `{HOST}` always name the allocated port and bind host. An
/// override value may refer to another override key, which is substituted
/// after that key's own `{PORT}`/`{HOST}` references are filled in.
pub fn resolve(
    service: &Service,
    host: &str,
    command: &str,
    field: &str,
) -> Result<ResolvedLaunch, Vec<TemplateError>> {
    let mut base: HashMap<String, String> = HashMap::new();
    base.insert("HOST".to_string(), host.to_string());
    if let Some(port) = service.port {
        base.insert("PORT".to_string(), port.to_string());
    }

    let partial: BTreeMap<&str, String> = service
        .env_overrides
        .iter()
        .map(|(k, v)| (k.as_str(), substitute(v, &base)))
        .collect();

    let mut vars = base.clone();
    for (key, value) in &partial {
        vars.entry((*key).to_string()).or_insert_with(|| value.clone());
    }

    let mut errors = Vec::new();
    let mut env: BTreeMap<String, String> = base.into_iter().collect();
    for (key, value) in &partial {
        match render(value, &vars, &format!("env override {}", key)) {
            Ok(v) => {
                env.insert((*key).to_string(), v);
            }
            Err(errs) => errors.extend(errs),
        }
    }

    let command = match render(command, &vars, field) {
        Ok(c) => c,
        Err(errs) => {
            errors.extend(errs);
            String::new()
        }
    };

    if errors.is_empty() {
        Ok(ResolvedLaunch { command, env })
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::model::fixtures;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn port_and_host_substituted() {
        let mut svc = fixtures::with_port("a", "web", 3005);
        svc.start_command = "python -m http.server {PORT} --bind {HOST}".to_string();
        let launch = resolve(&svc, "127.0.0.1", &svc.start_command, "start_command").unwrap();
        assert_eq!(
            launch.command,
            "python -m http.server 3005 --bind 127.0.0.1"
        );
        assert_eq!(launch.env["PORT"], "3005");
        assert_eq!(launch.env["HOST"], "127.0.0.1");
    }

    #[test]
    fn shell_variables_left_untouched() {
        let v = vars(&[("PORT", "3000")]);
        assert_eq!(
            render("echo ${PORT} {PORT} $HOME", &v, "cmd").unwrap(),
            "echo ${PORT} 3000 $HOME"
        );
    }

    #[test]
    fn lowercase_braces_are_not_placeholders() {
        let v = vars(&[]);
        assert_eq!(
            render(r#"node -e 'console.log({a: 1})' {x}"#, &v, "cmd").unwrap(),
            r#"node -e 'console.log({a: 1})' {x}"#
        );
    }

    #[test]
    fn missing_port_is_error() {
        let mut svc = fixtures::service("a", "web");
        svc.start_command = "serve --port {PORT}".to_string();
        let errs = resolve(&svc, "127.0.0.1", &svc.start_command, "start_command").unwrap_err();
        assert_eq!(
            errs,
            vec![TemplateError::MissingPort {
                field: "start_command".to_string()
            }]
        );
        assert_eq!(
            errs[0].to_string(),
            "start_command uses {PORT} but the service has no port assigned"
        );
    }

    #[test]
    fn unknown_placeholder_suggests_closest() {
        let v = vars(&[("PORT", "3000"), ("API_URL", "x")]);
        let errs = render("run {API_UR}", &v, "start_command").unwrap_err();
        assert_eq!(errs.len(), 1);
        assert_eq!(
            errs[0].to_string(),
            "unresolved placeholder '{API_UR}' in start_command (did you mean `{API_URL}`?)"
        );
    }

    #[test]
    fn all_unknown_placeholders_reported() {
        let v = vars(&[]);
        let errs = render("{ONE} {TWO}", &v, "cmd").unwrap_err();
        assert_eq!(errs.len(), 2);
    }

    #[test]
    fn overrides_win_and_may_reference_port() {
        let mut svc = fixtures::with_port("a", "api", 4100);
        svc.env_overrides
            .insert("HOST".to_string(), "0.0.0.0".to_string());
        svc.env_overrides
            .insert("BASE_URL".to_string(), "http://{HOST}:{PORT}".to_string());
        svc.start_command = "serve {BASE_URL}".to_string();

        let launch = resolve(&svc, "127.0.0.1", &svc.start_command, "start_command").unwrap();
        assert_eq!(launch.env["HOST"], "0.0.0.0");
        assert_eq!(launch.env["BASE_URL"], "http://127.0.0.1:4100");
        assert_eq!(launch.env["PORT"], "4100");
        assert_eq!(launch.command, "serve http://127.0.0.1:4100");
    }

    #[test]
    fn override_referencing_another_override() {
        let mut svc = fixtures::with_port("a", "api", 4100);
        svc.env_overrides
            .insert("API".to_string(), "http://{HOST}:{PORT}".to_string());
        svc.env_overrides
            .insert("HEALTH".to_string(), "{API}/health".to_string());

        let launch = resolve(&svc, "127.0.0.1", "run", "start_command").unwrap();
        assert_eq!(launch.env["HEALTH"], "http://127.0.0.1:4100/health");
    }

    #[test]
    fn errors_in_env_and_command_collected_together() {
        let mut svc = fixtures::service("a", "api");
        svc.env_overrides
            .insert("LISTEN".to_string(), ":{PORT}".to_string());
        svc.start_command = "run {NOPE}".to_string();
        let errs = resolve(&svc, "127.0.0.1", &svc.start_command, "start_command").unwrap_err();
        assert_eq!(errs.len(), 2);
        assert!(matches!(errs[0], TemplateError::MissingPort { .. }));
        assert!(matches!(errs[1], TemplateError::UnresolvedPlaceholder { .. }));
    }
}
