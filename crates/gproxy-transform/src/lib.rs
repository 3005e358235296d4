mod count_tokens;
mod generate_content;
mod get_model;
mod list_models;
pub mod middleware;
mod stream2nostream;
