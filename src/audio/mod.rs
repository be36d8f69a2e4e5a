pub mod analyzer;
pub mod automation;
pub mod clock;
pub mod deck;
pub mod dsp;
pub mod engine;
pub mod mixer;
pub mod stems;
