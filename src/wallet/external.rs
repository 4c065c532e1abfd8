// This file is Copyright its original authors, visible in version control history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. You may not use this file except in
// accordance with one or both of these licenses.

use crate::error::Error;
use crate::logger::{log_error, Logger};

use std::sync::Arc;

/// A wallet living outside of this process.
///
/// It only ever receives the funding outputs to create and later hands back a signed
/// transaction, so none of the in-process wallet capabilities are available.
pub(crate) struct ExternalWallet {
	logger: Arc<Logger>,
}

impl ExternalWallet {
	pub(crate) fn new(logger: Arc<Logger>) -> Self {
		Self { logger }
	}

	pub(crate) fn unsupported<T>(&self, operation: &str) -> Result<T, Error> {
		log_error!(self.logger, "The external wallet does not support {}", operation);
		Err(Error::WalletOperationUnsupported)
	}
}
