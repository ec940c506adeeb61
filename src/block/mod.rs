/*
 * This file is part of ModernFS.
 *
 * ModernFS is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * ModernFS is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * ModernFS. If not, see <https://www.gnu.org/licenses/>.
 */

//! The block engine: §4.A/§4.B of the design — positioned I/O over the
//! disk image, fronted by an in-memory buffer cache.

mod cache;
mod device;

pub use cache::{BufferCache, DEFAULT_CAPACITY};
pub use device::BlockDevice;
