use thiserror::Error;

/// Fatal review-domain errors. Everything here aborts the run; transient
/// conditions (up-to-date fetches, one unparseable remote URL among several)
/// are handled where they occur and never reach this type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReviewError {
    #[error("merge commits are not supported in the review workflow")]
    MergeCommitsUnsupported,

    /// A `fixup!` commit was found with no matching target in the range.
    #[error("unmatched fixups")]
    UnmatchedFixups,

    /// More than one open pull request already uses the change's head branch.
    #[error("too many matching pull requests")]
    TooManyPullRequests,

    /// None of the remote's URLs points at a supported forge.
    #[error("not implemented")]
    NoSupportedForge,

    #[error("empty change")]
    EmptyChange,
}
