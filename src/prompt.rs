/*
  printhost, a 3D printer build controller.
  Copyright (C) 2023 the printhost developers.

  printhost is free software: you can redistribute it and/or modify
  it under the terms of the GNU General Public License as published by
  the Free Software Foundation, either version 3 of the License, or
  (at your option) any later version.

  printhost is distributed in the hope that it will be useful,
  but WITHOUT ANY WARRANTY; without even the implied warranty of
  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
  GNU General Public License for more details.

  You should have received a copy of the GNU General Public License
  along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/

//! The user-dialog seam between the build pipeline and whatever front end
//! is attached.

use tracing::info;

/// Presents halt dialogs and SD error messages to the user.
///
/// The pipeline blocks on `confirm` while deciding whether to continue past
/// an optional halt, so implementations should not stall indefinitely when
/// no user is present.
pub trait UserPrompt: Send + Sync {
    /// Show an informational message.
    fn info(&self, message: &str);

    /// Ask a yes/no question; `true` means continue.
    fn confirm(&self, message: &str) -> bool;
}

/// The headless default: messages go to the log, and optional halts
/// continue the build, which matches unattended operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct SilentPrompt;

impl UserPrompt for SilentPrompt {
    fn info(&self, message: &str) {
        info!("{message}");
    }

    fn confirm(&self, message: &str) -> bool {
        info!("{message} (continuing; no user attached)");
        true
    }
}
