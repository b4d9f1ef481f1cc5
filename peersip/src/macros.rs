/// Expands to the `fmt` body shared by the To and From headers:
/// `Name: "realname" <uri>;tag=x`.
macro_rules! fmt_name_addr_with_tag {
    () => {
        fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
            write!(
                f,
                "{}: {}",
                <Self as crate::headers::SipHeaderParse>::NAME,
                crate::message::NameAddr(self.uri())
            )?;
            if let Some(tag) = self.tag() {
                write!(f, ";tag={tag}")?;
            }
            Ok(())
        }
    };
}

pub(crate) use fmt_name_addr_with_tag;
