/// Listing models takes no path, query, or body parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ListModelsRequest;
