//! The instructions we send to vision models along with each page.

use handlebars::Handlebars;
use serde_json::json;

use crate::prelude::*;

/// The default OCR prompt. `{{language}}` is replaced with the output
/// language.
pub const DEFAULT_OCR_PROMPT: &str = "Just transcribe the text in this image and \
preserve the formatting and layout (high quality OCR). Do that for ALL the text in \
the image. Be thorough and pay attention. This is very important. The image is from \
a text document so be sure to continue until the bottom of the page. Thanks a lot! \
You tend to forget about some text in the image so please focus! Use markdown \
format but without a code block. Write the text in {{language}}.";

/// The default output language.
pub const DEFAULT_LANGUAGE: &str = "English";

/// Render an OCR prompt template.
///
/// Templates use Handlebars syntax. The only binding is `language`. Output is
/// not HTML-escaped.
pub fn render_ocr_prompt(template: &str, language: &str) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars.set_strict_mode(true);
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars
        .render_template(template, &json!({ "language": language }))
        .context("failed to render OCR prompt template")
}
