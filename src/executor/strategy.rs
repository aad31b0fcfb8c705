use serde_json::{json, Value};

use crate::driver::{DriverError, ElementHandle, PageDriver};
use crate::models::ActionKind;

use super::ActionValue;

pub(crate) const CLICK_SCRIPT: &str = "const el = arguments[0];\
 el.scrollIntoView({block: 'center', inline: 'center'});\
 el.click();\
 return true;";

pub(crate) const POINTER_SCRIPT: &str = "const el = arguments[0];\
 const rect = el.getBoundingClientRect();\
 if (rect.width === 0 || rect.height === 0) { return false; }\
 const x = rect.left + rect.width / 2;\
 const y = rect.top + rect.height / 2;\
 const target = document.elementFromPoint(x, y) || el;\
 for (const type of ['pointerdown', 'mousedown', 'pointerup', 'mouseup', 'click']) {\
   target.dispatchEvent(new MouseEvent(type, {bubbles: true, cancelable: true, view: window, clientX: x, clientY: y, button: 0}));\
 }\
 return true;";

pub(crate) const READ_ATTRIBUTE_SCRIPT: &str = "const el = arguments[0];\
 const value = el.getAttribute(arguments[1]) || el[arguments[1]];\
 return value == null ? null : String(value);";

pub(crate) const READ_TEXT_SCRIPT: &str = "const el = arguments[0];\
 return (el.innerText || el.textContent || el.value || '').trim();";

/// One way of getting an action done against an already resolved element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// The driver's own click / attribute / text calls.
    Native,
    /// The same action performed by page script.
    Script,
    /// Synthetic pointer events dispatched at the element's centre.
    Pointer,
}

const CLICK_ORDER: [Strategy; 3] = [Strategy::Native, Strategy::Script, Strategy::Pointer];
const READ_ORDER: [Strategy; 2] = [Strategy::Native, Strategy::Script];

impl Strategy {
    pub fn for_kind(kind: &ActionKind) -> &'static [Strategy] {
        match kind {
            ActionKind::Click => &CLICK_ORDER,
            ActionKind::Read { .. } => &READ_ORDER,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Strategy::Native => "native",
            Strategy::Script => "script",
            Strategy::Pointer => "pointer",
        }
    }

    pub async fn attempt(
        self,
        driver: &dyn PageDriver,
        element: &ElementHandle,
        kind: &ActionKind,
    ) -> Result<ActionValue, DriverError> {
        match (self, kind) {
            (Strategy::Native, ActionKind::Click) => {
                driver.click(element).await?;
                Ok(ActionValue::Clicked)
            }
            (Strategy::Script, ActionKind::Click) => {
                let value = driver
                    .invoke_script(CLICK_SCRIPT, vec![element.script_arg()])
                    .await?;
                script_confirmed(value, "scripted click returned false")
            }
            (Strategy::Pointer, ActionKind::Click) => {
                let value = driver
                    .invoke_script(POINTER_SCRIPT, vec![element.script_arg()])
                    .await?;
                script_confirmed(value, "element has no clickable area")
            }
            (Strategy::Native, ActionKind::Read { attribute: Some(name) }) => {
                let value = driver.read_attribute(element, name).await?;
                non_empty(value, name)
            }
            (Strategy::Native, ActionKind::Read { attribute: None }) => {
                let text = driver.read_text(element).await?;
                non_empty(Some(text), "text")
            }
            (Strategy::Script, ActionKind::Read { attribute: Some(name) }) => {
                let value = driver
                    .invoke_script(READ_ATTRIBUTE_SCRIPT, vec![element.script_arg(), json!(name)])
                    .await?;
                non_empty(value.as_str().map(str::to_string), name)
            }
            (Strategy::Script, ActionKind::Read { attribute: None }) => {
                let value = driver
                    .invoke_script(READ_TEXT_SCRIPT, vec![element.script_arg()])
                    .await?;
                non_empty(value.as_str().map(str::to_string), "text")
            }
            (Strategy::Pointer, ActionKind::Read { .. }) => Err(DriverError::NotInteractable(
                "pointer strategy cannot read values".into(),
            )),
        }
    }
}

fn script_confirmed(value: Value, reason: &str) -> Result<ActionValue, DriverError> {
    if value.as_bool() == Some(false) {
        Err(DriverError::NotInteractable(reason.to_string()))
    } else {
        Ok(ActionValue::Clicked)
    }
}

fn non_empty(value: Option<String>, what: &str) -> Result<ActionValue, DriverError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(ActionValue::Text(v)),
        _ => Err(DriverError::NotInteractable(format!("`{what}` is empty"))),
    }
}
