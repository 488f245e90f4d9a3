//! Built-in step programs

pub mod article;
pub mod stop;

#[cfg(test)]
mod tests;

use crate::engine::Engine;

pub use article::{article_program, ARTICLE_WORKFLOW};
pub use stop::{stop_program, STOP_WORKFLOW};

/// Register every built-in program with the engine.
pub fn register_builtin(engine: &mut Engine) {
    let article = article_program(engine.config());
    let stop = stop_program(engine.config());
    engine.register(article);
    engine.register(stop);
}
