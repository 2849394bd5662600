//! Prompt texts sent to the chat.

/// Literal markers the follow-up asks the model to wrap its answer in.
pub const YES_MARKER: &str = "{YES}";
pub const NO_MARKER: &str = "{NO}";

/// Closing prompt asking for a single bracketed word.
pub const FOLLOWUP_PROMPT: &str = "On the basis of above analysis, ANSWER only YES or NO. \
No explanation is needed. Wrap your ANSWER in curly braces.";

/// Comparison prompt for one task. Category pages are answered NO outright;
/// product pages are compared by identifiers, photos and descriptions.
pub fn comparison_prompt(competitor_url: &str, client_url: &str) -> String {
    format!(
        "Determine if this page {competitor_url} is a Category page containing multiple products \
or an individual Product page. If it is a Category page and then no need to proceed further, \
terminate your processing and report ANSWER as NO If it is a Product page then compare with this \
product page {client_url} to determine if they are identical for price-matching. Use product \
identifiers (SKU, MPN, UPC, GTIN), photos, and descriptions for verification, noting that \
retailers and manufacturers may interchange these identifiers. If it is a match then report \
ANSWER as YES otherwise report ANSWER as NO"
    )
}

/// Text to type for a prompt; the trailing newline submits it.
pub fn submission(prompt: &str) -> String {
    format!("{}\n", prompt.trim_end())
}
