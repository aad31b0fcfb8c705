use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bridge::AutomationBridge;
use crate::executor::ActionExecutor;
use crate::models::{Locator, LocatorSet};
use crate::pipeline::ExtractionPipeline;
use crate::status::{InstructionBuffer, StatusSink};

/// Buttons on the annotation page that hotkeys press directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PageControls {
    pub select: LocatorSet,
    pub skip: LocatorSet,
    pub submit: LocatorSet,
}

impl Default for PageControls {
    fn default() -> Self {
        Self {
            select: LocatorSet::new(
                Locator::xpath("//button[contains(@class, 'ivu-btn') and contains(., '选中')]"),
                vec![Locator::xpath("//*[self::button or self::a][contains(., '选中')]")],
            ),
            skip: LocatorSet::new(
                Locator::xpath(
                    "//button[contains(@class, 'mrm ivu-btn ivu-btn-default ivu-btn-large')]//span[text()='跳过']/parent::button",
                ),
                vec![
                    Locator::xpath("//button[contains(., '跳过')]"),
                    Locator::xpath("//*[contains(text(), '跳过')]"),
                ],
            ),
            submit: LocatorSet::new(
                Locator::xpath("//button[contains(@class, 'ivu-btn') and contains(., '提交')]"),
                vec![Locator::xpath("//button[@type='submit']")],
            ),
        }
    }
}

/// Everything a fired command or the poller needs, built once at startup.
pub struct SessionContext {
    pub executor: Arc<ActionExecutor>,
    pub pipeline: Arc<ExtractionPipeline>,
    pub bridge: Arc<AutomationBridge>,
    pub instructions: Arc<InstructionBuffer>,
    pub sink: Arc<dyn StatusSink>,
    pub controls: PageControls,
}
