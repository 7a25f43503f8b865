use std::time::{Duration, Instant};

use color_eyre::{eyre::bail, Result};
use pretty_assertions::assert_eq;
use serial_bridge::{
    device::{CloseFlags, Device, State},
    endpoint::{
        serial::{find_serial, Serial},
        Setting,
    },
    error::Error,
    selector::Selector,
};

mod common;
use common::*;

fn open(pty: &Pty, char_pacing: Duration) -> Result<(Selector, usize)> {
    let serial = Serial::builder(pty.path())
        .set_char_pacing(char_pacing)
        .build()?;

    let mut selector = Selector::new();
    let id = selector.add(Device::serial(serial, 256))?;
    selector.run_once(Some(Duration::ZERO))?;

    let index = selector.index_of(id).unwrap();
    assert_eq!(selector.device(index)?.state(), State::Connected);

    Ok((selector, index))
}

fn spin_until<F>(selector: &mut Selector, mut done: F) -> Result<()>
where
    F: FnMut(&mut Selector) -> bool,
{
    let started = Instant::now();

    while !done(selector) {
        if started.elapsed() > PATIENCE {
            bail!("Gave up waiting");
        }
        match selector.run_once(Some(Duration::from_millis(10))) {
            Ok(_) => {}
            Err(e) if e.is_transient() => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

#[test]
fn read_from_device() -> Result<()> {
    let mut pty = Pty::new()?;
    let (mut selector, index) = open(&pty, Duration::ZERO)?;

    let text = lipsum::lipsum_words(12);
    pty.send(text.as_bytes())?;

    spin_until(&mut selector, |selector| {
        selector.device(index).unwrap().rx().used() >= text.len()
    })?;

    let device = selector.device_mut(index)?;
    let mut buf = vec![0; text.len()];
    assert_eq!(device.read(&mut buf)?, text.len());
    assert_eq!(String::from_utf8_lossy(&buf), text);
    assert_eq!(device.state(), State::Active);

    Ok(())
}

#[test]
fn write_to_device() -> Result<()> {
    let mut pty = Pty::new()?;
    let (mut selector, index) = open(&pty, Duration::ZERO)?;

    assert_eq!(selector.device_mut(index)?.write(b"AT+RESET\n")?, 9);

    let mut received = vec![];
    spin_until(&mut selector, |_| {
        pty.received(&mut received).unwrap();
        received.len() >= 9
    })?;

    assert_eq!(received, b"AT+RESET\n");
    assert!(selector.device(index)?.tx().is_empty());

    Ok(())
}

#[test]
fn characters_are_paced() -> Result<()> {
    let pacing = Duration::from_millis(20);

    let mut pty = Pty::new()?;
    let (mut selector, index) = open(&pty, pacing)?;

    let started = Instant::now();
    selector.device_mut(index)?.write(b"abcd")?;

    let mut received = vec![];
    spin_until(&mut selector, |_| {
        pty.received(&mut received).unwrap();
        received.len() >= 4
    })?;

    assert_eq!(received, b"abcd");
    // Each character after the first waits for the one before
    assert!(started.elapsed() >= pacing * 3 - Duration::from_millis(5));

    Ok(())
}

#[test]
fn baud_rate_can_change_while_open() -> Result<()> {
    let pty = Pty::new()?;
    let (mut selector, index) = open(&pty, Duration::ZERO)?;
    let device = selector.device_mut(index)?;

    device.configure(Setting::Baud(9600))?;
    assert!(matches!(
        device.configure(Setting::Baud(1234)),
        Err(Error::InvalidBaudRate(1234))
    ));
    assert!(matches!(
        device.configure(Setting::NoDelay(true)),
        Err(Error::InvalidConfiguration(_))
    ));

    Ok(())
}

#[test]
fn closed_serial_device_reopens() -> Result<()> {
    let pty = Pty::new()?;
    let (mut selector, index) = open(&pty, Duration::ZERO)?;

    let device = selector.device_mut(index)?;
    device.close(CloseFlags::NONE);
    assert_eq!(device.state(), State::Closed);
    assert!(device.fd().is_none());

    selector.run_once(Some(Duration::ZERO))?;
    assert_eq!(selector.device(index)?.state(), State::Connected);

    Ok(())
}

#[test]
fn flushing_close_drains_first() -> Result<()> {
    let mut pty = Pty::new()?;
    let (mut selector, index) = open(&pty, Duration::ZERO)?;

    let device = selector.device_mut(index)?;
    device.write(b"bye\n")?;
    device.close(CloseFlags::FLUSH | CloseFlags::INACTIVE);
    assert_eq!(device.state(), State::Closing);

    spin_until(&mut selector, |selector| {
        selector.device(index).unwrap().state() == State::Inactive
    })?;

    let mut received = vec![];
    pty.received(&mut received)?;
    assert_eq!(received, b"bye\n");

    Ok(())
}

#[test]
fn device_going_away_is_closed() -> Result<()> {
    let pty = Pty::new()?;
    let (mut selector, index) = open(&pty, Duration::ZERO)?;

    drop(pty);

    spin_until(&mut selector, |selector| {
        selector.device(index).unwrap().state() == State::Inactive
    })?;

    Ok(())
}

#[test]
fn found_by_exact_path() -> Result<()> {
    let pty = Pty::new()?;

    assert_eq!(find_serial(pty.path())?.to_string_lossy(), pty.path());

    let spec = format!("/nonexistent/ttyFOO|{}", pty.path());
    assert_eq!(find_serial(&spec)?.to_string_lossy(), pty.path());

    Ok(())
}
