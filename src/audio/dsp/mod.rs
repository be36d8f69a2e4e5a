pub mod drive;
pub mod echo;
pub mod filter;

use serde::{Deserialize, Serialize};

use self::{
    drive::DriveStage,
    echo::{EchoSettings, EchoStage},
    filter::{DeckFilter, FilterState},
};

/// One change to a deck's effect chain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fx", content = "value", rename_all = "snake_case")]
pub enum FxChange {
    Filter(FilterState),
    Echo(Option<EchoSettings>),
    Drive(f32),
    /// Bypass every stage.
    Clear,
}

/// Per-deck chain: filter → echo → drive.
pub struct DeckFx {
    pub filter: DeckFilter,
    pub echo: EchoStage,
    pub drive: DriveStage,
}

impl DeckFx {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            filter: DeckFilter::new(sample_rate),
            echo: EchoStage::new(sample_rate),
            drive: DriveStage::new(),
        }
    }

    pub fn apply(&mut self, change: FxChange) {
        match change {
            FxChange::Filter(state) => self.filter.set(state),
            FxChange::Echo(settings) => self.echo.set(settings),
            FxChange::Drive(amount) => self.drive.set(amount),
            FxChange::Clear => {
                self.filter.reset();
                self.echo.set(None);
                self.drive.set(0.0);
            }
        }
    }

    #[inline]
    pub fn process(&mut self, sample: f32) -> f32 {
        let s = self.filter.process(sample);
        let s = self.echo.process(s);
        self.drive.process(s)
    }
}
