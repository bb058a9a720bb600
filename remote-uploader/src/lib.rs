//! Over-the-air firmware uploads for Optiboot targets
//!
//! A programmer sits between a radio link and the serial port of an AVR
//! target. Programming packets arriving from the remote host are handed to a
//! [Dispatcher], which stages the image in nonvolatile storage and, once the
//! whole image has arrived, resets the target and writes it through the
//! Optiboot bootloader with read-back verification.
//!
//! The host side of the protocol lives in [sketch] and [packet].

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod bootloader;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod flasher;
pub mod packet;
pub mod session;
pub mod sketch;
pub mod storage;

pub use self::{
    bootloader::{Bootloader, Device},
    config::Config,
    dispatcher::Dispatcher,
    error::Error,
    flasher::{FlashTarget, Flasher},
    packet::{is_flash_packet, is_programming_packet, ReplyCode},
    session::ProgrammingSession,
    storage::{FileStore, MemoryStore, StagingStore},
};
