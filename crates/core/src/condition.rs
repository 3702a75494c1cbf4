//! Checkpoint conditions
//!
//! A [`Condition`] is evaluated once per poll attempt and reports what it
//! observed, so a failed assertion can say why.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HarnessError, HarnessResult};
use crate::mock::{values_equal, DispatchOutcome, InterceptedRequest, RouteRegistry, UrlPattern};
use crate::page::{resolve_url, PageDriver, ProbeRequest};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeRef {
    pub selector: String,
    pub attribute: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Condition {
    /// At least one match is visible
    Visible { selector: String },
    /// No match is visible (absent counts as hidden)
    Hidden { selector: String },
    TextContains { selector: String, text: String },
    /// Attribute of the first match contains every listed substring
    AttributeContains {
        selector: String,
        attribute: String,
        contains: Vec<String>,
    },
    UrlContains { value: String },
    UrlNotContains { value: String },
    /// Exactly one selector in the list has a visible match
    ExactlyOneVisible { selectors: Vec<String> },
    Count {
        selector: String,
        #[serde(default)]
        min: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
        #[serde(default)]
        equals: Option<usize>,
    },
    /// JavaScript expression evaluating to a truthy value
    Expression { script: String },
    /// Dispatch log contains matching requests
    Request {
        pattern: String,
        #[serde(default)]
        method: Option<String>,
        /// JSON pointer -> expected value in the request body
        #[serde(default)]
        json: BTreeMap<String, Value>,
        /// Status the registry answered with
        #[serde(default)]
        status: Option<u16>,
        /// Exact number of matches; at least one when omitted
        #[serde(default)]
        count: Option<usize>,
    },
    /// Direct HTTP probe of a URL, literal or read from an element
    Resource {
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        from_attribute: Option<AttributeRef>,
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        content_type: Option<String>,
    },
}

/// Result of one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub passed: bool,
    pub observed: String,
}

impl Observation {
    fn new(passed: bool, observed: impl Into<String>) -> Self {
        Self {
            passed,
            observed: observed.into(),
        }
    }
}

/// What a condition can look at
pub struct CheckContext<'a> {
    pub page: &'a dyn PageDriver,
    pub registry: &'a RouteRegistry,
    pub base_url: &'a str,
}

impl Condition {
    pub fn describe(&self) -> String {
        match self {
            Condition::Visible { selector } => format!("{} is visible", selector),
            Condition::Hidden { selector } => format!("{} is hidden", selector),
            Condition::TextContains { selector, text } => {
                format!("{} contains text '{}'", selector, text)
            }
            Condition::AttributeContains {
                selector,
                attribute,
                contains,
            } => format!("{}[{}] contains {:?}", selector, attribute, contains),
            Condition::UrlContains { value } => format!("URL contains '{}'", value),
            Condition::UrlNotContains { value } => format!("URL does not contain '{}'", value),
            Condition::ExactlyOneVisible { selectors } => {
                format!("exactly one of {:?} is visible", selectors)
            }
            Condition::Count { selector, .. } => format!("count of {}", selector),
            Condition::Expression { script } => format!("`{}` is truthy", script),
            Condition::Request {
                pattern, method, ..
            } => format!(
                "request {} {} was dispatched",
                method.as_deref().unwrap_or("*"),
                pattern
            ),
            Condition::Resource { url, from_attribute, .. } => match (url, from_attribute) {
                (Some(url), _) => format!("resource {} is served", url),
                (None, Some(attr)) => {
                    format!("resource at {}[{}] is served", attr.selector, attr.attribute)
                }
                (None, None) => "resource is served".to_string(),
            },
        }
    }

    pub async fn evaluate(&self, ctx: &CheckContext<'_>) -> HarnessResult<Observation> {
        match self {
            Condition::Visible { selector } => {
                let state = ctx.page.query(selector).await?;
                Ok(Observation::new(
                    state.visible > 0,
                    format!("{} matches, {} visible", state.count, state.visible),
                ))
            }
            Condition::Hidden { selector } => {
                let state = ctx.page.query(selector).await?;
                Ok(Observation::new(
                    state.visible == 0,
                    format!("{} matches, {} visible", state.count, state.visible),
                ))
            }
            Condition::TextContains { selector, text } => {
                let state = ctx.page.query(selector).await?;
                let actual = state.text.unwrap_or_default();
                Ok(Observation::new(
                    state.visible > 0 && actual.contains(text.as_str()),
                    format!("text {:?} ({} visible)", actual, state.visible),
                ))
            }
            Condition::AttributeContains {
                selector,
                attribute,
                contains,
            } => {
                let value = ctx.page.attribute(selector, attribute).await?;
                let passed = value
                    .as_deref()
                    .map(|v| contains.iter().all(|needle| v.contains(needle.as_str())))
                    .unwrap_or(false);
                Ok(Observation::new(passed, format!("{}={:?}", attribute, value)))
            }
            Condition::UrlContains { value } => {
                let url = ctx.page.url().await?;
                Ok(Observation::new(url.contains(value.as_str()), url))
            }
            Condition::UrlNotContains { value } => {
                let url = ctx.page.url().await?;
                Ok(Observation::new(!url.contains(value.as_str()), url))
            }
            Condition::ExactlyOneVisible { selectors } => {
                let mut visible = Vec::new();
                for selector in selectors {
                    if ctx.page.query(selector).await?.any_visible() {
                        visible.push(selector.as_str());
                    }
                }
                Ok(Observation::new(
                    visible.len() == 1,
                    format!("visible: {:?}", visible),
                ))
            }
            Condition::Count {
                selector,
                min,
                max,
                equals,
            } => {
                let count = ctx.page.query(selector).await?.count;
                let passed = equals.map_or(true, |n| count == n)
                    && min.map_or(true, |n| count >= n)
                    && max.map_or(true, |n| count <= n);
                Ok(Observation::new(passed, format!("{} matches", count)))
            }
            Condition::Expression { script } => {
                let value = ctx.page.evaluate(script).await?;
                Ok(Observation::new(is_truthy(&value), value.to_string()))
            }
            Condition::Request {
                pattern,
                method,
                json,
                status,
                count,
            } => {
                let pattern = UrlPattern::parse(pattern)?;
                let candidates = ctx.registry.records_matching(&pattern, method.as_deref());
                let matching = candidates
                    .iter()
                    .filter(|record| {
                        json.iter().all(|(pointer, expected)| {
                            record
                                .json_body
                                .as_ref()
                                .and_then(|body| body.pointer(pointer))
                                .map_or(false, |actual| values_equal(expected, actual))
                        })
                    })
                    .filter(|record| match status {
                        Some(expected) => {
                            record.outcome == DispatchOutcome::Fulfilled { status: *expected }
                        }
                        None => true,
                    })
                    .count();
                let passed = match count {
                    Some(n) => matching == *n,
                    None => matching > 0,
                };
                Ok(Observation::new(
                    passed,
                    format!("{} matching of {} dispatched", matching, candidates.len()),
                ))
            }
            Condition::Resource {
                url,
                from_attribute,
                status,
                content_type,
            } => {
                let target = match (url, from_attribute) {
                    (Some(url), _) => url.clone(),
                    (None, Some(attr)) => {
                        match ctx.page.attribute(&attr.selector, &attr.attribute).await? {
                            Some(value) if !value.is_empty() => value,
                            _ => {
                                return Ok(Observation::new(
                                    false,
                                    format!("{}[{}] is empty", attr.selector, attr.attribute),
                                ))
                            }
                        }
                    }
                    (None, None) => {
                        return Err(HarnessError::Scenario(
                            "resource check needs url or from_attribute".to_string(),
                        ))
                    }
                };
                let absolute = resolve_url(&origin_of(ctx, &target).await?, &target);

                let (code, ctype) = match ctx
                    .registry
                    .lookup(&InterceptedRequest::new("GET", absolute.as_str()))
                {
                    Some(response) => (response.status, response.content_type().map(String::from)),
                    None => {
                        let response = ctx.page.fetch(&ProbeRequest::get(absolute.as_str())).await?;
                        (response.status, response.content_type().map(String::from))
                    }
                };

                let status_ok = status.map_or((200..300).contains(&code), |s| s == code);
                let type_ok = content_type.as_deref().map_or(true, |expected| {
                    ctype
                        .as_deref()
                        .map_or(false, |actual| actual.starts_with(expected))
                });
                Ok(Observation::new(
                    status_ok && type_ok,
                    format!("{} -> {} {}", absolute, code, ctype.unwrap_or_default()),
                ))
            }
        }
    }
}

/// Origin relative resource URLs resolve against: the page's, else the base URL
async fn origin_of(ctx: &CheckContext<'_>, target: &str) -> HarnessResult<String> {
    if target.contains("://") {
        return Ok(String::new());
    }
    let page_url = ctx.page.url().await?;
    Ok(origin(&page_url).unwrap_or_else(|| ctx.base_url.to_string()))
}

fn origin(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    if !scheme.starts_with("http") {
        return None;
    }
    let host = rest.split(['/', '?', '#']).next()?;
    Some(format!("{}://{}", scheme, host))
}

/// JavaScript truthiness of a JSON value
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test_case(json!(null), false)]
    #[test_case(json!(0), false)]
    #[test_case(json!(""), false)]
    #[test_case(json!("0"), true)]
    #[test_case(json!([]), true)]
    #[test_case(json!(2.5), true)]
    fn test_truthiness(value: Value, expected: bool) {
        assert_eq!(is_truthy(&value), expected);
    }

    #[test_case("http://127.0.0.1:8080/app/index.html?x=1", Some("http://127.0.0.1:8080"))]
    #[test_case("https://sandbox.phonepe.com/pay", Some("https://sandbox.phonepe.com"))]
    #[test_case("about:blank", None)]
    fn test_origin(url: &str, expected: Option<&str>) {
        assert_eq!(origin(url).as_deref(), expected);
    }

    #[test]
    fn test_parse_conditions() {
        let condition: Condition = serde_yaml::from_str(
            r#"
check: attribute_contains
selector: '#audioPreview'
attribute: src
contains: [api/stock-music/preview, key=stock]
"#,
        )
        .unwrap();
        assert!(matches!(condition, Condition::AttributeContains { ref contains, .. } if contains.len() == 2));

        let condition: Condition = serde_yaml::from_str(
            r#"
check: request
pattern: '**/api/payment/initiate'
method: POST
json: {/amount: 49900}
status: 200
"#,
        )
        .unwrap();
        match condition {
            Condition::Request { json, status, count, .. } => {
                assert_eq!(json.get("/amount"), Some(&json!(49900)));
                assert_eq!(status, Some(200));
                assert_eq!(count, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
