/// Extension (without the leading dot) of the artifact a provider writes.
pub trait FileExtProvider {
    fn file_ext(&self) -> &'static str;
}
