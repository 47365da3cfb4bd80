include!("http/core.rs");
include!("http/public.rs");
include!("http/admin.rs");
