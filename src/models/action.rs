use std::fmt;

use serde::{Deserialize, Serialize};

/// How the driver should find an element.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "using", content = "value")]
pub enum Locator {
    #[serde(rename = "css")]
    Css(String),
    #[serde(rename = "xpath")]
    XPath(String),
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css(selector.into())
    }

    pub fn xpath(expression: impl Into<String>) -> Self {
        Locator::XPath(expression.into())
    }

    /// Strategy name understood by W3C WebDriver endpoints.
    pub fn strategy(&self) -> &'static str {
        match self {
            Locator::Css(_) => "css selector",
            Locator::XPath(_) => "xpath",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Locator::Css(value) | Locator::XPath(value) => value,
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(value) => write!(f, "css={value}"),
            Locator::XPath(value) => write!(f, "xpath={value}"),
        }
    }
}

/// A primary locator plus the alternatives tried after a fresh page snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocatorSet {
    pub primary: Locator,
    #[serde(default)]
    pub fallbacks: Vec<Locator>,
}

impl LocatorSet {
    pub fn new(primary: Locator, fallbacks: Vec<Locator>) -> Self {
        Self { primary, fallbacks }
    }

    pub fn click(&self) -> ActionDescriptor {
        ActionDescriptor::new(self, ActionKind::Click)
    }

    pub fn read_text(&self) -> ActionDescriptor {
        ActionDescriptor::new(self, ActionKind::Read { attribute: None })
    }

    pub fn read_attribute(&self, attribute: &str) -> ActionDescriptor {
        ActionDescriptor::new(
            self,
            ActionKind::Read {
                attribute: Some(attribute.to_string()),
            },
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    Click,
    /// Reads an attribute, or the visible text when `attribute` is `None`.
    Read { attribute: Option<String> },
}

impl ActionKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::Read { .. } => "read",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionDescriptor {
    pub primary: Locator,
    pub fallbacks: Vec<Locator>,
    pub kind: ActionKind,
}

impl ActionDescriptor {
    pub fn new(set: &LocatorSet, kind: ActionKind) -> Self {
        Self {
            primary: set.primary.clone(),
            fallbacks: set.fallbacks.clone(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_serializes_with_strategy_tag() {
        let locator = Locator::xpath("//button[contains(., '跳过')]");
        let json = serde_json::to_value(&locator).unwrap();
        assert_eq!(json["using"], "xpath");
        assert_eq!(json["value"], "//button[contains(., '跳过')]");

        let back: Locator = serde_json::from_value(json).unwrap();
        assert_eq!(back, locator);
        assert_eq!(Locator::css("img.task").strategy(), "css selector");
    }
}
